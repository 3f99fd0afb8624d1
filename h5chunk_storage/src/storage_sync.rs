use std::sync::Arc;

use auto_impl::auto_impl;
use itertools::Itertools;

use super::{Bytes, FileAddress, FileRegion, StorageError};

/// Readable block storage traits.
#[auto_impl(Arc)]
pub trait ReadableBlockStorageTraits: Send + Sync {
    /// Read the bytes of a file region.
    ///
    /// Bytes beyond the current end of the storage read as zero.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn read(&self, region: FileRegion) -> Result<Bytes, StorageError>;

    /// Read the bytes of many file regions in a single request.
    ///
    /// The default implementation reads each region in turn.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn read_vector(&self, regions: &[FileRegion]) -> Result<Vec<Bytes>, StorageError> {
        regions.iter().map(|region| self.read(*region)).try_collect()
    }

    /// Return the size in bytes of the storage.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if there is an underlying storage error.
    fn size(&self) -> Result<u64, StorageError>;
}

/// Writable block storage traits.
#[auto_impl(Arc)]
pub trait WritableBlockStorageTraits: Send + Sync {
    /// Write `value` at `offset`, growing the storage as needed.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to write.
    fn write(&self, offset: FileAddress, value: &[u8]) -> Result<(), StorageError>;

    /// Write many values in a single request.
    ///
    /// The default implementation writes each value in turn.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to write.
    fn write_vector(&self, writes: &[(FileAddress, &[u8])]) -> Result<(), StorageError> {
        for (offset, value) in writes {
            self.write(*offset, value)?;
        }
        Ok(())
    }

    /// Truncate or extend the storage to `size` bytes.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to truncate.
    fn truncate(&self, size: u64) -> Result<(), StorageError>;
}

/// A supertrait of [`ReadableBlockStorageTraits`] and [`WritableBlockStorageTraits`].
pub trait ReadableWritableBlockStorageTraits:
    ReadableBlockStorageTraits + WritableBlockStorageTraits
{
    /// Return a readable version of the store.
    fn readable(self: Arc<Self>) -> Arc<dyn ReadableBlockStorageTraits>;

    /// Return a writable version of the store.
    fn writable(self: Arc<Self>) -> Arc<dyn WritableBlockStorageTraits>;
}

impl<T> ReadableWritableBlockStorageTraits for T
where
    T: ReadableBlockStorageTraits + WritableBlockStorageTraits + 'static,
{
    fn readable(self: Arc<Self>) -> Arc<dyn ReadableBlockStorageTraits> {
        self.clone()
    }

    fn writable(self: Arc<Self>) -> Arc<dyn WritableBlockStorageTraits> {
        self.clone()
    }
}
