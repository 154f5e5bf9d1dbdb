//! Collector configuration.

use std::env;

/// Default full-collection threshold: bytes allocated since the last
/// collection before `allocate` forces a full cycle.
pub(crate) const DEFAULT_MAJOR_COLLECTION_THRESHOLD: usize = 16 * 1024 * 1024;

/// Default incremental-mark threshold: bytes allocated since the last mark
/// increment before `allocate` runs another one.
pub(crate) const DEFAULT_INCMARK_THRESHOLD: usize = 2 * 1024 * 1024;

/// Default shadow stack capacity, in root entries.
pub(crate) const DEFAULT_SHADOWSTACK_CAPACITY: usize = 16 * 1024;

/// Tunable collector parameters.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Bytes since the last collection that trigger a full collection.
    pub major_collection_threshold: usize,
    /// Bytes since the last mark increment that trigger the next one.
    pub incmark_threshold: usize,
    /// Shadow stack capacity in entries. Running past it is fatal.
    pub shadowstack_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            major_collection_threshold: DEFAULT_MAJOR_COLLECTION_THRESHOLD,
            incmark_threshold: DEFAULT_INCMARK_THRESHOLD,
            shadowstack_capacity: DEFAULT_SHADOWSTACK_CAPACITY,
        }
    }
}

impl CollectorConfig {
    /// Reads the thresholds from the `MAJOR_COLLECTION` and `INCMARK`
    /// environment variables (bytes). Missing or unparsable values fall
    /// back to the compiled defaults silently.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            major_collection_threshold: env_threshold(
                "MAJOR_COLLECTION",
                DEFAULT_MAJOR_COLLECTION_THRESHOLD,
            ),
            incmark_threshold: env_threshold("INCMARK", DEFAULT_INCMARK_THRESHOLD),
            shadowstack_capacity: DEFAULT_SHADOWSTACK_CAPACITY,
        }
    }
}

fn env_threshold(var: &str, fallback: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}
