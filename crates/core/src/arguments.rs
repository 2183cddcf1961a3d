//! Runtime argument scoping
//!
//! Program-level runtime arguments may target datasets through scoped keys:
//!
//! ```text
//! dataset.*.ttl = 60          # applies to every dataset
//! dataset.purchases.ttl = 30  # applies to "purchases" only
//! ```
//!
//! When a dataset is requested, its effective arguments are built in three
//! layers, later layers overriding earlier ones:
//! 1. wildcard-scoped runtime arguments (`dataset.*.`)
//! 2. name-scoped runtime arguments (`dataset.<name>.`)
//! 3. arguments passed explicitly with the request
//!
//! Unscoped runtime arguments never reach datasets.

use crate::key::Arguments;

/// Scope prefix for dataset arguments
pub const DATASET_SCOPE: &str = "dataset";

/// Scope name that matches every dataset
pub const WILDCARD: &str = "*";

/// Effective arguments for dataset `name`
pub fn scoped_arguments(name: &str, runtime: &Arguments, explicit: &Arguments) -> Arguments {
    let wildcard_prefix = format!("{}.{}.", DATASET_SCOPE, WILDCARD);
    let name_prefix = format!("{}.{}.", DATASET_SCOPE, name);

    let mut result = extract(runtime, &wildcard_prefix);
    result.extend(extract(runtime, &name_prefix));
    result.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
    result
}

fn extract(runtime: &Arguments, prefix: &str) -> Arguments {
    runtime
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), v.clone()))
        })
        .collect()
}
