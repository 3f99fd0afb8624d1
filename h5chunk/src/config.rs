//! `h5chunk` global configuration options.
//!
//! See [`Config`] for the list of options.

use std::sync::LazyLock;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

/// Global configuration options for the `h5chunk` crate.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with [`global_config_mut`].
///
/// ## Chunk Cache Slots
/// > default: `521`
///
/// The number of hash slots of the raw data chunk cache of a newly created or opened dataset.
/// A prime number keeps collisions between chunks of regular strides low.
///
/// ## Chunk Cache Bytes
/// > default: `1048576` (1 MiB)
///
/// The byte budget of the raw data chunk cache of a newly created or opened dataset.
/// Chunks larger than the budget bypass the cache.
///
/// ## Chunk Cache Preemption Weight
/// > default: `0.75`
///
/// The fraction of cache entries examined by the first (fully read or fully written) pruning pass before the second (any unlocked entry) pass starts.
/// A value of `0.0` starts both passes at once, `1.0` never starts the second pass until the first has examined every entry.
///
/// ## Selection I/O
/// > default: [`true`]
///
/// If enabled, unfiltered chunks that are too large for the chunk cache are read and written for a whole I/O call with one vectored storage request.
///
/// ## Validate Checksums
/// > default: [`true`]
///
/// If enabled, error detecting filters such as `fletcher32` verify their checksum when a chunk is decoded.
///
/// ## Deflate Level
/// > default: `6`
///
/// The compression level used by [`FilterPipeline::with_deflate_default`](crate::filter::FilterPipeline::with_deflate_default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    chunk_cache_nslots: usize,
    chunk_cache_nbytes: usize,
    chunk_cache_w0: f64,
    selection_io: bool,
    validate_checksums: bool,
    deflate_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_cache_nslots: 521,
            chunk_cache_nbytes: 1024 * 1024,
            chunk_cache_w0: 0.75,
            selection_io: true,
            validate_checksums: true,
            deflate_level: 6,
        }
    }
}

impl Config {
    /// Get the [chunk cache slots](#chunk-cache-slots) configuration.
    #[must_use]
    pub fn chunk_cache_nslots(&self) -> usize {
        self.chunk_cache_nslots
    }

    /// Set the [chunk cache slots](#chunk-cache-slots) configuration.
    pub fn set_chunk_cache_nslots(&mut self, nslots: usize) -> &mut Self {
        self.chunk_cache_nslots = nslots;
        self
    }

    /// Get the [chunk cache bytes](#chunk-cache-bytes) configuration.
    #[must_use]
    pub fn chunk_cache_nbytes(&self) -> usize {
        self.chunk_cache_nbytes
    }

    /// Set the [chunk cache bytes](#chunk-cache-bytes) configuration.
    pub fn set_chunk_cache_nbytes(&mut self, nbytes: usize) -> &mut Self {
        self.chunk_cache_nbytes = nbytes;
        self
    }

    /// Get the [chunk cache preemption weight](#chunk-cache-preemption-weight) configuration.
    #[must_use]
    pub fn chunk_cache_w0(&self) -> f64 {
        self.chunk_cache_w0
    }

    /// Set the [chunk cache preemption weight](#chunk-cache-preemption-weight) configuration.
    ///
    /// The weight is clamped to `[0.0, 1.0]`.
    pub fn set_chunk_cache_w0(&mut self, w0: f64) -> &mut Self {
        self.chunk_cache_w0 = w0.clamp(0.0, 1.0);
        self
    }

    /// Get the [selection I/O](#selection-io) configuration.
    #[must_use]
    pub fn selection_io(&self) -> bool {
        self.selection_io
    }

    /// Set the [selection I/O](#selection-io) configuration.
    pub fn set_selection_io(&mut self, selection_io: bool) -> &mut Self {
        self.selection_io = selection_io;
        self
    }

    /// Get the [validate checksums](#validate-checksums) configuration.
    #[must_use]
    pub fn validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    /// Set the [validate checksums](#validate-checksums) configuration.
    pub fn set_validate_checksums(&mut self, validate_checksums: bool) -> &mut Self {
        self.validate_checksums = validate_checksums;
        self
    }

    /// Get the [deflate level](#deflate-level) configuration.
    #[must_use]
    pub fn deflate_level(&self) -> u32 {
        self.deflate_level
    }

    /// Set the [deflate level](#deflate-level) configuration.
    ///
    /// The level is clamped to `[0, 9]`.
    pub fn set_deflate_level(&mut self, level: u32) -> &mut Self {
        self.deflate_level = level.min(9);
        self
    }
}

static CONFIG: LazyLock<RwLock<Config>> = LazyLock::new(|| RwLock::new(Config::default()));

/// Returns a reference to the global `h5chunk` configuration.
///
/// # Deadlocks
/// Calling this while holding the guard of [`global_config_mut`] on the same thread will deadlock.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read()
}

/// Returns a mutable reference to the global `h5chunk` configuration.
///
/// # Deadlocks
/// Calling this while holding any other guard of the global configuration on the same thread will deadlock.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG.write()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn config_validate_checksums() {
        assert!(global_config().validate_checksums());
        global_config_mut().set_validate_checksums(false);
        assert!(!global_config().validate_checksums());
        global_config_mut().set_validate_checksums(true);
    }

    #[test]
    fn config_defaults_serde() -> Result<(), serde_json::Error> {
        let config: Config = serde_json::from_str(r#"{"chunk_cache_nslots": 13}"#)?;
        assert_eq!(config.chunk_cache_nslots(), 13);
        assert_eq!(config.chunk_cache_nbytes(), 1024 * 1024);
        assert!((config.chunk_cache_w0() - 0.75).abs() < f64::EPSILON);
        let mut config = config;
        config.set_chunk_cache_w0(1.5).set_deflate_level(12);
        assert!((config.chunk_cache_w0() - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.deflate_level(), 9);
        Ok(())
    }
}
