//! Configuration of the [`Registry`](crate::registry::Registry)
//!
//! The Configuration can either be built programmatically or loaded from
//! Environment-Variables, which all use the `MEMSYNC_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MEMSYNC_REGISTRY_CAPACITY` | Number of Entries the Registry can hold | 1024 |
//! | `MEMSYNC_REGISTRY_FLUSH_BATCH` | Operations performed by `flush_batch` | 64 |
//!
//! # Example
//! ```rust
//! # use memsync::config::RegistryConfig;
//! let config = RegistryConfig::builder()
//!     .capacity(256)
//!     .flush_batch(8)
//!     .build();
//!
//! assert_eq!(256, config.capacity);
//! ```

use std::env;

/// The Environment-Variable for [`RegistryConfig::capacity`]
pub const ENV_CAPACITY: &str = "MEMSYNC_REGISTRY_CAPACITY";
/// The Environment-Variable for [`RegistryConfig::flush_batch`]
pub const ENV_FLUSH_BATCH: &str = "MEMSYNC_REGISTRY_FLUSH_BATCH";

/// The Configuration of a Registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// The Number of Entries the Registry can hold, not counting the
    /// Placeholders.
    /// Default: 1024
    pub capacity: usize,

    /// The maximum Number of Operations performed by a single call to
    /// `Flusher::flush_batch`.
    /// Default: 64
    pub flush_batch: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            flush_batch: 64,
        }
    }
}

impl RegistryConfig {
    /// Creates a Builder that starts out with the default Values
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Loads the Configuration from the Environment.
    ///
    /// Variables that are not set, can't be parsed or are zero are ignored
    /// and the default is used instead.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(capacity) = parse_nonzero(&lookup, ENV_CAPACITY) {
            config.capacity = capacity;
        }
        if let Some(batch) = parse_nonzero(&lookup, ENV_FLUSH_BATCH) {
            config.flush_batch = batch;
        }

        config
    }
}

fn parse_nonzero<F>(lookup: &F, name: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<usize>() {
        Ok(0) => {
            log::warn!("Ignoring {}=0, using the default", name);
            None
        }
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// Builder for a [`RegistryConfig`]
#[derive(Debug, Clone, Default)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    /// Sets the Number of Entries
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Sets the Number of Operations per Flush-Batch
    pub fn flush_batch(mut self, flush_batch: usize) -> Self {
        self.config.flush_batch = flush_batch;
        self
    }

    /// Builds the final Configuration
    pub fn build(self) -> RegistryConfig {
        self.config
    }
}
