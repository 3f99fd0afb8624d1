//! A synchronous filesystem block store.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    Bytes, FileAddress, FileRegion, ReadableBlockStorageTraits, StorageError,
    WritableBlockStorageTraits,
};

/// A synchronous block store backed by a single file on the filesystem.
#[derive(Debug)]
pub struct FilesystemBlockStore {
    path: PathBuf,
    readonly: bool,
    file: RwLock<File>,
}

impl FilesystemBlockStore {
    /// Open or create a filesystem block store at `path`.
    ///
    /// # Errors
    /// Returns a [`FilesystemBlockStoreCreateError`] if `path` is not valid or the file cannot be opened.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, FilesystemBlockStoreCreateError> {
        let path = path.as_ref().to_path_buf();
        if path.to_str().is_none() || path.is_dir() {
            return Err(FilesystemBlockStoreCreateError::InvalidPath(path));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let readonly = path.exists() && std::fs::metadata(&path)?.permissions().readonly();
        let file = if readonly {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        };

        Ok(Self {
            path,
            readonly,
            file: RwLock::new(file),
        })
    }

    /// Return the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the underlying file is read only.
    #[must_use]
    pub const fn readonly(&self) -> bool {
        self.readonly
    }

    fn read_impl(file: &mut File, file_size: u64, region: FileRegion) -> Result<Bytes, StorageError> {
        let length = usize::try_from(region.length)
            .map_err(|_| StorageError::Other(format!("{region} exceeds usize::MAX")))?;
        let mut buf = BytesMut::zeroed(length);
        if region.offset < file_size {
            let available = usize::try_from(std::cmp::min(region.end(), file_size) - region.offset)
                .map_err(|_| StorageError::Other(format!("{region} exceeds usize::MAX")))?;
            file.seek(SeekFrom::Start(region.offset))?;
            file.read_exact(&mut buf[..available])?;
        }
        Ok(buf.freeze())
    }
}

impl ReadableBlockStorageTraits for FilesystemBlockStore {
    fn read(&self, region: FileRegion) -> Result<Bytes, StorageError> {
        let mut file = self.file.write();
        let file_size = file.metadata()?.len();
        Self::read_impl(&mut file, file_size, region)
    }

    fn read_vector(&self, regions: &[FileRegion]) -> Result<Vec<Bytes>, StorageError> {
        let mut file = self.file.write();
        let file_size = file.metadata()?.len();
        regions
            .iter()
            .map(|region| Self::read_impl(&mut file, file_size, *region))
            .collect()
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.file.read().metadata()?.len())
    }
}

impl WritableBlockStorageTraits for FilesystemBlockStore {
    fn write(&self, offset: FileAddress, value: &[u8]) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(value)?;
        Ok(())
    }

    fn write_vector(&self, writes: &[(FileAddress, &[u8])]) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }
        let mut file = self.file.write();
        for (offset, value) in writes {
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(value)?;
        }
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }
        self.file.write().set_len(size)?;
        Ok(())
    }
}

/// A filesystem block store creation error.
#[derive(Debug, Error)]
pub enum FilesystemBlockStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("path {0} is not valid")]
    InvalidPath(PathBuf),
}
