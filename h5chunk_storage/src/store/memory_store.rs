//! A synchronous in-memory block store.

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::{
    Bytes, FileAddress, FileRegion, ReadableBlockStorageTraits, StorageError,
    WritableBlockStorageTraits,
};

/// A synchronous in-memory block store.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    data: Mutex<BytesMut>,
}

impl MemoryBlockStore {
    /// Create a new empty memory block store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::default(),
        }
    }

    /// Return a copy of the entire contents of the store.
    #[must_use]
    pub fn contents(&self) -> Bytes {
        self.data.lock().clone().freeze()
    }
}

fn to_usize(value: u64) -> Result<usize, StorageError> {
    usize::try_from(value).map_err(|_| StorageError::Other(format!("{value} exceeds usize::MAX")))
}

impl ReadableBlockStorageTraits for MemoryBlockStore {
    fn read(&self, region: FileRegion) -> Result<Bytes, StorageError> {
        let data = self.data.lock();
        let start = to_usize(region.offset)?;
        let length = to_usize(region.length)?;
        let mut out = BytesMut::with_capacity(length);
        if start < data.len() {
            let end = std::cmp::min(start + length, data.len());
            out.extend_from_slice(&data[start..end]);
        }
        out.put_bytes(0, length - out.len());
        Ok(out.freeze())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.data.lock().len() as u64)
    }
}

impl WritableBlockStorageTraits for MemoryBlockStore {
    fn write(&self, offset: FileAddress, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let offset = to_usize(offset)?;
        let end = offset + value.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(value);
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<(), StorageError> {
        let size = to_usize(size)?;
        self.data.lock().resize(size, 0);
        Ok(())
    }
}
