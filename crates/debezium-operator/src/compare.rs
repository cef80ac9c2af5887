//! Desired vs. observed connector configuration comparison

use crate::connect::ConnectorConfig;

/// Strict equality of two connector configurations
///
/// Equal iff both maps have the same key set and byte-identical values. No
/// normalization is attempted: a value the upstream reformats (`"01"` vs `"1"`)
/// or a default it adds counts as drift.
pub fn configs_equal(desired: &ConnectorConfig, observed: &ConnectorConfig) -> bool {
    desired.len() == observed.len()
        && desired
            .iter()
            .all(|(key, value)| observed.get(key).is_some_and(|v| v.as_bytes() == value.as_bytes()))
}
