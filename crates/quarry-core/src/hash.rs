//! Stable fingerprints for operators, memo keys, and history records.
//!
//! History entries are keyed by a canonical digest of the operator shape so
//! that equal sub-plans from different queries share measurements.

use blake3::Hasher;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    /// First 16 hex chars; enough for log lines and test assertions.
    pub fn short(&self) -> String {
        self.to_hex()[..16].to_string()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn digest_bytes(bytes: &[u8]) -> Digest {
    let mut h = Hasher::new();
    h.update(bytes);
    Digest(h.finalize().into())
}

pub fn digest_str(s: &str) -> Digest {
    digest_bytes(s.as_bytes())
}

/// Digest any serde-serializable value deterministically (via JSON).
/// Fine for planning-time fingerprints; not a hot path.
pub fn fingerprint<T: Serialize>(v: &T) -> Result<Digest> {
    let bytes = serde_json::to_vec(v)?;
    Ok(digest_bytes(&bytes))
}

/// Incremental digest builder for composite fingerprints (operator shape +
/// child fingerprints) without intermediate allocations.
pub struct DigestWriter {
    hasher: Hasher,
}

impl DigestWriter {
    pub fn new(tag: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(tag.as_bytes());
        Self { hasher }
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        // Length prefix keeps ("ab","c") distinct from ("a","bc").
        self.hasher.update(&(s.len() as u32).to_le_bytes());
        self.hasher.update(s.as_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.hasher.update(&v.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.hasher.update(&v.to_le_bytes());
        self
    }

    pub fn write_digest(&mut self, d: &Digest) -> &mut Self {
        self.hasher.update(&d.0);
        self
    }

    pub fn finish(&self) -> Digest {
        Digest(self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_64_chars() {
        let d = digest_str("nation");
        assert_eq!(d.to_hex().len(), 64);
        assert_eq!(d.short().len(), 16);
    }

    #[test]
    fn writer_is_order_and_boundary_sensitive() {
        let mut a = DigestWriter::new("scan");
        a.write_str("ab").write_str("c");
        let mut b = DigestWriter::new("scan");
        b.write_str("a").write_str("bc");
        assert_ne!(a.finish(), b.finish());

        let mut c = DigestWriter::new("scan");
        c.write_str("ab").write_str("c");
        assert_eq!(a.finish(), c.finish());
    }
}
