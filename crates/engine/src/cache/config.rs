//! Dataset cache configuration
//!
//! Everything a cache needs at construction time except its collaborators
//! (instantiator, coordinator, metrics hook). Usually embedded in the
//! program's own config file, but it can be loaded standalone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strata_core::{Arguments, StrataError, StrataResult};

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Construction-time configuration of a `DatasetCache`
///
/// # Example
///
/// ```toml
/// # Namespace passed through to the instantiator unmodified
/// namespace = "analytics"
///
/// # Program runtime arguments; `dataset.<name>.` and `dataset.*.` scopes
/// # reach datasets, everything else is ignored by the cache
/// [runtime_arguments]
/// "dataset.*.ttl" = "3600"
///
/// # Datasets loaded eagerly that join every transaction
/// [static_datasets.purchases]
/// compression = "zstd"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Namespace the datasets live in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Program runtime arguments
    #[serde(default)]
    pub runtime_arguments: Arguments,
    /// Static datasets: name → explicit arguments
    #[serde(default)]
    pub static_datasets: BTreeMap<String, Arguments>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            runtime_arguments: Arguments::new(),
            static_datasets: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// Config for `namespace` with no arguments and no static datasets
    pub fn for_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Set the runtime arguments
    pub fn with_runtime_arguments(mut self, arguments: Arguments) -> Self {
        self.runtime_arguments = arguments;
        self
    }

    /// Declare a static dataset
    pub fn with_static_dataset(mut self, name: impl Into<String>, arguments: Arguments) -> Self {
        self.static_datasets.insert(name.into(), arguments);
        self
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or a static dataset name is empty.
    pub fn validate(&self) -> StrataResult<()> {
        if self.namespace.trim().is_empty() {
            return Err(StrataError::invalid_input("Cache namespace must not be empty"));
        }
        if self.static_datasets.keys().any(|name| name.trim().is_empty()) {
            return Err(StrataError::invalid_input("Static dataset names must not be empty"));
        }
        Ok(())
    }

    /// Parse and validate config from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or fails validation.
    pub fn from_toml_str(content: &str) -> StrataResult<Self> {
        let config: CacheConfig = toml::from_str(content).map_err(|e| {
            StrataError::invalid_input(format!("Failed to parse cache config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            StrataError::InvalidInput { message } => {
                StrataError::invalid_input(format!("{} ({})", message, path.display()))
            }
            other => other,
        })
    }

    /// Serialize this config to TOML
    pub fn to_toml_string(&self) -> StrataResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| StrataError::internal(format!("Failed to serialize config: {}", e)))
    }

    /// Serialize this config to TOML and write it to the given path
    pub fn write_to_file(&self, path: &Path) -> StrataResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| {
            StrataError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
