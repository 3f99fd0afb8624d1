//! A storage adapter which records performance metrics.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    Bytes, FileAddress, FileRegion, ReadableBlockStorageTraits, StorageError,
    WritableBlockStorageTraits,
};

/// The performance metrics storage adapter. Accumulates metrics, such as bytes read and written.
///
/// It is intended to aid in testing by allowing the application to validate that metrics (e.g., bytes read/written, total read/write operations) match expected values for specific operations.
///
/// A vectored request counts as a single read or write, and is additionally recorded in [`vector_reads`](Self::vector_reads) or [`vector_writes`](Self::vector_writes).
///
/// ### Example
/// ```rust
/// # use std::sync::Arc;
/// # use h5chunk_storage::store::MemoryBlockStore;
/// # use h5chunk_storage::storage_adapter::performance_metrics::PerformanceMetricsStorageAdapter;
/// let store = Arc::new(MemoryBlockStore::new());
/// let store = Arc::new(PerformanceMetricsStorageAdapter::new(store));
/// // do some store operations...
/// // assert_eq!(store.bytes_read(), ...);
/// // assert_eq!(store.bytes_written(), ...);
/// // assert_eq!(store.reads(), ...);
/// // assert_eq!(store.writes(), ...);
/// ```
#[derive(Debug)]
pub struct PerformanceMetricsStorageAdapter<TStorage: ?Sized> {
    storage: Arc<TStorage>,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    vector_reads: AtomicUsize,
    vector_writes: AtomicUsize,
}

impl<TStorage: ?Sized> PerformanceMetricsStorageAdapter<TStorage> {
    /// Create a new performance metrics storage adapter.
    #[must_use]
    pub fn new(storage: Arc<TStorage>) -> Self {
        Self {
            storage,
            bytes_read: AtomicUsize::default(),
            bytes_written: AtomicUsize::default(),
            reads: AtomicUsize::default(),
            writes: AtomicUsize::default(),
            vector_reads: AtomicUsize::default(),
            vector_writes: AtomicUsize::default(),
        }
    }

    /// Reset the performance metrics.
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.vector_reads.store(0, Ordering::Relaxed);
        self.vector_writes.store(0, Ordering::Relaxed);
    }

    /// Returns the number of bytes read.
    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes written.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of read requests.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of write requests.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of vectored read requests.
    pub fn vector_reads(&self) -> usize {
        self.vector_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of vectored write requests.
    pub fn vector_writes(&self) -> usize {
        self.vector_writes.load(Ordering::Relaxed)
    }
}

impl<TStorage: ?Sized + ReadableBlockStorageTraits> ReadableBlockStorageTraits
    for PerformanceMetricsStorageAdapter<TStorage>
{
    fn read(&self, region: FileRegion) -> Result<Bytes, StorageError> {
        let value = self.storage.read(region);
        let bytes_read = value.as_ref().map_or(0, Bytes::len);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
        value
    }

    fn read_vector(&self, regions: &[FileRegion]) -> Result<Vec<Bytes>, StorageError> {
        let values = self.storage.read_vector(regions)?;
        let bytes_read = values.iter().map(Bytes::len).sum();
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.vector_reads.fetch_add(1, Ordering::Relaxed);
        Ok(values)
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.storage.size()
    }
}

impl<TStorage: ?Sized + WritableBlockStorageTraits> WritableBlockStorageTraits
    for PerformanceMetricsStorageAdapter<TStorage>
{
    fn write(&self, offset: FileAddress, value: &[u8]) -> Result<(), StorageError> {
        self.bytes_written.fetch_add(value.len(), Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.write(offset, value)
    }

    fn write_vector(&self, writes: &[(FileAddress, &[u8])]) -> Result<(), StorageError> {
        let bytes_written = writes.iter().map(|(_, value)| value.len()).sum();
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.vector_writes.fetch_add(1, Ordering::Relaxed);
        self.storage.write_vector(writes)
    }

    fn truncate(&self, size: u64) -> Result<(), StorageError> {
        self.storage.truncate(size)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryBlockStore;

    use super::*;

    #[test]
    fn performance_metrics() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryBlockStore::new());
        let store = PerformanceMetricsStorageAdapter::new(store);
        store.write(0, &[0, 1, 2, 3])?;
        store.write_vector(&[(4, &[4, 5]), (6, &[6])])?;
        store.read(FileRegion::new(0, 2))?;
        store.read_vector(&[FileRegion::new(0, 1), FileRegion::new(1, 3)])?;
        assert_eq!(store.bytes_written(), 7);
        assert_eq!(store.bytes_read(), 6);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.reads(), 2);
        assert_eq!(store.vector_writes(), 1);
        assert_eq!(store.vector_reads(), 1);
        store.reset();
        assert_eq!(store.reads(), 0);
        assert_eq!(store.bytes_written(), 0);
        Ok(())
    }
}
