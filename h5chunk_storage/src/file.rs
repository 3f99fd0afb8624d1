use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    Bytes, FileAddress, FileRegion, FreeSpaceManager, InvalidFileRegionError,
    ReadableBlockStorageTraits, ReadableWritableBlockStorage, StorageError,
    WritableBlockStorageTraits,
};

/// The intent a file was opened with.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct FileIntent {
    /// The file is open for writing.
    pub read_write: bool,
    /// The file is open as a single-writer/multiple-reader writer.
    ///
    /// Released file space is not returned to the free list, as concurrent readers may still reference it.
    pub swmr_write: bool,
    /// The file is open by a group of cooperating processes for parallel I/O.
    pub parallel: bool,
}

impl FileIntent {
    /// A read only intent.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            read_write: false,
            swmr_write: false,
            parallel: false,
        }
    }

    /// A read and write intent.
    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            read_write: true,
            swmr_write: false,
            parallel: false,
        }
    }

    /// Set the single-writer/multiple-reader flag.
    #[must_use]
    pub const fn with_swmr_write(mut self, swmr_write: bool) -> Self {
        self.swmr_write = swmr_write;
        self
    }

    /// Set the parallel flag.
    #[must_use]
    pub const fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// A handle to an open file: block storage, its free-space manager, and the open intent.
///
/// Block I/O on a handle is not subject to the free-space manager, callers are responsible for only touching regions they own.
#[derive(Clone)]
pub struct FileHandle {
    storage: ReadableWritableBlockStorage,
    space: Arc<Mutex<FreeSpaceManager>>,
    intent: FileIntent,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("space", &self.space)
            .field("intent", &self.intent)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    /// Open a file handle on `storage`.
    ///
    /// The free-space manager begins with its end of allocation at the current size of the storage.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the size of the storage cannot be retrieved.
    pub fn new(
        storage: ReadableWritableBlockStorage,
        intent: FileIntent,
    ) -> Result<Self, StorageError> {
        let eoa = storage.size()?;
        Ok(Self::new_with_space(storage, FreeSpaceManager::new(eoa), intent))
    }

    /// Open a file handle on `storage` with an explicit free-space manager.
    #[must_use]
    pub fn new_with_space(
        storage: ReadableWritableBlockStorage,
        space: FreeSpaceManager,
        intent: FileIntent,
    ) -> Self {
        Self {
            storage,
            space: Arc::new(Mutex::new(space)),
            intent,
        }
    }

    /// Return the open intent.
    #[must_use]
    pub const fn intent(&self) -> FileIntent {
        self.intent
    }

    /// Return the underlying storage.
    #[must_use]
    pub fn storage(&self) -> &ReadableWritableBlockStorage {
        &self.storage
    }

    /// Return the end of the allocated address space.
    #[must_use]
    pub fn eoa(&self) -> FileAddress {
        self.space.lock().eoa()
    }

    /// Return a snapshot of the free-space manager.
    #[must_use]
    pub fn space(&self) -> FreeSpaceManager {
        self.space.lock().clone()
    }

    fn check_region(&self, region: FileRegion) -> Result<(), StorageError> {
        let eoa = self.eoa();
        if region.end() > eoa {
            Err(InvalidFileRegionError::new(region, eoa).into())
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.intent.read_write {
            Ok(())
        } else {
            Err(StorageError::ReadOnly)
        }
    }

    /// Allocate `length` bytes of file space.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the file is read only or the space cannot be allocated.
    pub fn allocate(&self, length: u64) -> Result<FileRegion, StorageError> {
        self.check_writable()?;
        self.space.lock().allocate(length)
    }

    /// Release file space.
    ///
    /// Under single-writer/multiple-reader writing the region is leaked instead.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the file is read only or the region is not allocated.
    pub fn release(&self, region: FileRegion) -> Result<(), StorageError> {
        self.check_writable()?;
        if self.intent.swmr_write {
            return Ok(());
        }
        self.space.lock().release(region)
    }

    /// Read a region.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the region extends beyond the end of allocation or on an underlying storage error.
    pub fn read(&self, region: FileRegion) -> Result<Bytes, StorageError> {
        self.check_region(region)?;
        self.storage.read(region)
    }

    /// Read many regions in one request.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if any region extends beyond the end of allocation or on an underlying storage error.
    pub fn read_vector(&self, regions: &[FileRegion]) -> Result<Vec<Bytes>, StorageError> {
        for region in regions {
            self.check_region(*region)?;
        }
        self.storage.read_vector(regions)
    }

    /// Write `value` at `offset`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the file is read only, the region extends beyond the end of allocation, or on an underlying storage error.
    pub fn write(&self, offset: FileAddress, value: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.check_region(FileRegion::new(offset, value.len() as u64))?;
        self.storage.write(offset, value)
    }

    /// Write many values in one request.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the file is read only, any region extends beyond the end of allocation, or on an underlying storage error.
    pub fn write_vector(&self, writes: &[(FileAddress, &[u8])]) -> Result<(), StorageError> {
        self.check_writable()?;
        for (offset, value) in writes {
            self.check_region(FileRegion::new(*offset, value.len() as u64))?;
        }
        self.storage.write_vector(writes)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryBlockStore;

    use super::*;

    #[test]
    fn file_handle_read_only() -> Result<(), StorageError> {
        let file = FileHandle::new(Arc::new(MemoryBlockStore::new()), FileIntent::read_only())?;
        assert!(matches!(file.allocate(8), Err(StorageError::ReadOnly)));
        assert!(matches!(file.write(0, &[0]), Err(StorageError::ReadOnly)));
        assert!(matches!(
            file.read(FileRegion::new(0, 2)),
            Err(StorageError::InvalidFileRegion(_))
        ));
        Ok(())
    }

    #[test]
    fn file_handle_swmr_release() -> Result<(), StorageError> {
        let storage = Arc::new(MemoryBlockStore::new());
        storage.write(0, &[0; 16])?;
        let file = FileHandle::new(storage, FileIntent::read_write().with_swmr_write(true))?;
        assert_eq!(file.eoa(), 16);
        let region = file.allocate(8)?;
        assert_eq!(region, FileRegion::new(16, 8));
        file.write(region.offset, &[1; 8])?;
        assert_eq!(file.read(region)?.as_ref(), &[1; 8]);
        file.release(region)?;
        assert_eq!(file.eoa(), 24);
        assert_eq!(file.allocate(8)?, FileRegion::new(24, 8));
        Ok(())
    }
}
