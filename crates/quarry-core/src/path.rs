//! Subfield paths: ordered step sequences into complex-typed values.
//!
//! Paths mark which parts of a nested column are live. The optimizer interns
//! them per query; the catalog receives them by value inside column handles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptKey {
    String(String),
    Long(i64),
}

impl std::fmt::Display for SubscriptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptKey::String(s) => write!(f, "{s:?}"),
            SubscriptKey::Long(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Struct member access by name; the member ordinal when known.
    Field { name: String, index: Option<usize> },
    /// Array/map element access with a literal key.
    Subscript(SubscriptKey),
    /// Array/map element access with a wildcard key.
    AllSubscripts,
    /// Size-of-container.
    Cardinality,
}

impl Step {
    pub fn field(name: impl Into<String>) -> Self {
        Step::Field {
            name: name.into(),
            index: None,
        }
    }

    /// The struct member name a map key or field step selects, if any.
    /// Used when a map column is projected out as a struct.
    pub fn skyline_name(&self) -> Option<String> {
        match self {
            Step::Field { name, .. } => Some(name.clone()),
            Step::Subscript(SubscriptKey::String(s)) => Some(s.clone()),
            Step::Subscript(SubscriptKey::Long(v)) => Some(v.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Field { name, .. } => write!(f, ".{name}"),
            Step::Subscript(key) => write!(f, "[{key}]"),
            Step::AllSubscripts => write!(f, "[*]"),
            Step::Cardinality => write!(f, ".cardinality()"),
        }
    }
}

/// A path into a nested value, e.g. `.address.lines[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subfield(pub Vec<Step>);

impl Subfield {
    pub fn new(steps: Vec<Step>) -> Self {
        Self(steps)
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Subfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for step in &self.0 {
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reads_like_an_access_chain() {
        let path = Subfield::new(vec![
            Step::field("address"),
            Step::Subscript(SubscriptKey::Long(0)),
            Step::field("zip"),
        ]);
        assert_eq!(path.to_string(), ".address[0].zip");
    }

    #[test]
    fn skyline_names() {
        assert_eq!(
            Step::Subscript(SubscriptKey::String("city".into())).skyline_name(),
            Some("city".into())
        );
        assert_eq!(Step::AllSubscripts.skyline_name(), None);
    }
}
