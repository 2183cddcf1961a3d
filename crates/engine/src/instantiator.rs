//! Dataset instantiation interface
//!
//! The instantiator turns a dataset name and its arguments into a live
//! dataset. Where the dataset lives and how it is opened is entirely the
//! instantiator's business; the cache only decides *when* to call it.

use std::sync::Arc;
use strata_core::{Arguments, Dataset, StrataResult};

/// Produces live datasets for the cache
pub trait DatasetInstantiator: Send + Sync {
    /// Instantiate dataset `name` in `namespace`
    ///
    /// Returns `Ok(None)` if no such dataset exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset exists but cannot be opened.
    fn load(
        &self,
        namespace: &str,
        name: &str,
        arguments: &Arguments,
    ) -> StrataResult<Option<Arc<dyn Dataset>>>;

    /// Release connections held by the instantiator
    ///
    /// Called once, when the owning cache closes.
    fn close(&self) -> StrataResult<()> {
        Ok(())
    }
}
