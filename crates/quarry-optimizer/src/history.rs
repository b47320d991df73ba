//! Cross-query execution history.
//!
//! A durable map from canonical operator fingerprint to measured
//! cardinality/bytes, used to recalibrate estimates in later plans. The
//! store is process-wide: many optimizers, each on its own thread, read and
//! append concurrently. Entries are append-only; a lookup sees a consistent
//! snapshot.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use quarry_core::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fingerprint: String,
    pub cardinality: f64,
    pub bytes: f64,
    pub timestamp: u64,
}

/// Read/write interface the optimizer and the runtime share.
pub trait History: Send + Sync {
    /// Recorded output cardinality for a node fingerprint, if any.
    fn lookup(&self, fingerprint: &str) -> Option<HistoryEntry>;

    /// Records one measurement. Newer entries replace older ones for the
    /// same fingerprint.
    fn record(&self, entry: HistoryEntry);

    /// Cached sampling result for a (layout, columns, filters) digest.
    fn cached_sample(&self, key: &str) -> Option<f64>;

    fn cache_sample(&self, key: &str, selectivity: f64);
}

/// Measured per-node stats the runtime reports after executing a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: String,
    pub cardinality: f64,
    pub bytes: f64,
}

/// Persists measured cardinalities against the plan's canonical history
/// keys. Nodes without a history key (exchanges, limits) are skipped.
pub fn record_execution(
    history: &dyn History,
    plan: &crate::emit::PlanAndStats,
    stats: &[NodeStats],
) {
    let timestamp = now_secs();
    for stat in stats {
        if let Some(fingerprint) = plan.history_keys.get(&stat.node_id) {
            history.record(HistoryEntry {
                fingerprint: fingerprint.clone(),
                cardinality: stat.cardinality,
                bytes: stat.bytes,
                timestamp,
            });
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// In-memory history with newline-delimited-JSON persistence.
#[derive(Default)]
pub struct FileHistory {
    entries: RwLock<HashMap<String, HistoryEntry>>,
    samples: RwLock<HashMap<String, f64>>,
}

impl FileHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Convenience for recording a measurement taken now.
    pub fn record_now(&self, fingerprint: impl Into<String>, cardinality: f64, bytes: f64) {
        self.record(HistoryEntry {
            fingerprint: fingerprint.into(),
            cardinality,
            bytes,
            timestamp: now_secs(),
        });
    }

    /// Writes all entries as one JSON record per line.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let entries = self.entries.read();
        let mut sorted: Vec<&HistoryEntry> = entries.values().collect();
        sorted.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        let mut out = Vec::new();
        for entry in sorted {
            serde_json::to_writer(&mut out, entry)?;
            out.push(b'\n');
        }
        let mut file = fs::File::create(path)
            .map_err(|e| Error::Internal(format!("cannot create history file {path}: {e}")))?;
        file.write_all(&out)
            .map_err(|e| Error::Internal(format!("cannot write history file {path}: {e}")))?;
        Ok(())
    }

    /// Merges entries from a file written by `save_to_file`. Existing
    /// entries are replaced only by newer measurements.
    pub fn update_from_file(&self, path: &str) -> Result<()> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("cannot read history file {path}: {e}")))?;
        let mut entries = self.entries.write();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: HistoryEntry = serde_json::from_str(line)?;
            match entries.get(&entry.fingerprint) {
                Some(existing) if existing.timestamp > entry.timestamp => {}
                _ => {
                    entries.insert(entry.fingerprint.clone(), entry);
                }
            }
        }
        Ok(())
    }
}

impl History for FileHistory {
    fn lookup(&self, fingerprint: &str) -> Option<HistoryEntry> {
        self.entries.read().get(fingerprint).cloned()
    }

    fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.write();
        match entries.get(&entry.fingerprint) {
            Some(existing) if existing.timestamp > entry.timestamp => {}
            _ => {
                entries.insert(entry.fingerprint.clone(), entry);
            }
        }
    }

    fn cached_sample(&self, key: &str) -> Option<f64> {
        self.samples.read().get(key).copied()
    }

    fn cache_sample(&self, key: &str, selectivity: f64) {
        self.samples.write().insert(key.to_string(), selectivity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_lookup() {
        let history = FileHistory::new();
        history.record_now("scan nation", 25.0, 1000.0);
        let entry = history.lookup("scan nation").unwrap();
        assert_eq!(entry.cardinality, 25.0);
        assert!(history.lookup("scan region").is_none());
    }

    #[test]
    fn newer_entries_win() {
        let history = FileHistory::new();
        history.record(HistoryEntry {
            fingerprint: "x".into(),
            cardinality: 10.0,
            bytes: 0.0,
            timestamp: 100,
        });
        history.record(HistoryEntry {
            fingerprint: "x".into(),
            cardinality: 20.0,
            bytes: 0.0,
            timestamp: 50,
        });
        assert_eq!(history.lookup("x").unwrap().cardinality, 10.0);
    }

    #[test]
    fn sample_cache() {
        let history = FileHistory::new();
        assert!(history.cached_sample("k").is_none());
        history.cache_sample("k", 0.25);
        assert_eq!(history.cached_sample("k"), Some(0.25));
    }
}
