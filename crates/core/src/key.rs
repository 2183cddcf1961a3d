//! Dataset cache keys
//!
//! A `DatasetKey` identifies one cacheable dataset: its name plus the
//! arguments it was instantiated with. Equality and hashing are by content,
//! so two requests with the same name and arguments resolve to the same
//! cache entry. Arguments are kept in a `BTreeMap` so that iteration order
//! (and therefore `Display`) is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered mapping of dataset arguments
pub type Arguments = BTreeMap<String, String>;

/// Identity of a cacheable dataset
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetKey {
    name: String,
    arguments: Arguments,
}

impl DatasetKey {
    /// Create a key from a name and its arguments
    pub fn new(name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Create a key with no arguments
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Arguments::new())
    }

    /// Dataset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments the dataset is instantiated with
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.arguments.is_empty() {
            write!(f, "{{")?;
            for (i, (k, v)) in self.arguments.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}
