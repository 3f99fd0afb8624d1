//! The file block storage API for the `h5chunk` crate.
//!
//! A chunked dataset lives inside a single file-like address space.
//! This crate provides that address space as a block device ([`ReadableBlockStorageTraits`], [`WritableBlockStorageTraits`]),
//! a first-fit free-space manager ([`FreeSpaceManager`]), and a [`FileHandle`] combining the two with the open intent of the file.
//!
//! In-memory and filesystem block stores are included, as well as a [`PerformanceMetricsStorageAdapter`](storage_adapter::performance_metrics::PerformanceMetricsStorageAdapter) for counting storage operations.
//!
//! ## Licence
//! `h5chunk_storage` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod file;
mod file_region;
mod space;
pub mod storage_adapter;
mod storage_sync;
pub mod store;

use std::sync::Arc;

use thiserror::Error;

pub use file::{FileHandle, FileIntent};
pub use file_region::{FileRegion, InvalidFileRegionError};
pub use space::FreeSpaceManager;
pub use storage_sync::{
    ReadableBlockStorageTraits, ReadableWritableBlockStorageTraits, WritableBlockStorageTraits,
};

/// [`Arc`] wrapped readable block storage.
pub type ReadableBlockStorage = Arc<dyn ReadableBlockStorageTraits>;

/// [`Arc`] wrapped writable block storage.
pub type WritableBlockStorage = Arc<dyn WritableBlockStorageTraits>;

/// [`Arc`] wrapped readable and writable block storage.
pub type ReadableWritableBlockStorage = Arc<dyn ReadableWritableBlockStorageTraits>;

/// The type for bytes returned by block storage reads.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// A file address.
pub type FileAddress = u64;

/// A storage error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A write operation was attempted on a read only file.
    #[error("a write operation was attempted on a read only file")]
    ReadOnly,
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] Arc<std::io::Error>),
    /// An invalid file region.
    #[error(transparent)]
    InvalidFileRegion(#[from] InvalidFileRegionError),
    /// The free-space manager could not allocate a region.
    #[error("unable to allocate {0} bytes of file space")]
    AllocationFailed(u64),
    /// The free-space manager could not release a region.
    #[error("unable to free file space {0}")]
    FreeFailed(FileRegion),
    /// The requested method is not supported.
    #[error("{0}")]
    Unsupported(String),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}
