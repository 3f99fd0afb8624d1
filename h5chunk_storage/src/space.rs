//! File free-space management.

use std::collections::BTreeMap;

use crate::{FileAddress, FileRegion, StorageError};

/// A first-fit free-space manager for a file address space.
///
/// Space is handed out from a free list of released regions where possible, otherwise from the end of the allocated address space (the EOA).
/// Released regions are coalesced with their neighbours, and a free region reaching the EOA shrinks the EOA.
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceManager {
    eoa: FileAddress,
    free: BTreeMap<FileAddress, u64>,
}

impl FreeSpaceManager {
    /// Create a new free-space manager with everything below `eoa` considered allocated.
    #[must_use]
    pub fn new(eoa: FileAddress) -> Self {
        Self {
            eoa,
            free: BTreeMap::new(),
        }
    }

    /// Return the end of the allocated address space.
    #[must_use]
    pub const fn eoa(&self) -> FileAddress {
        self.eoa
    }

    /// Return the total number of bytes in the free list.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.free.values().sum()
    }

    /// Return the free regions in address order.
    pub fn free_regions(&self) -> impl Iterator<Item = FileRegion> + '_ {
        self.free
            .iter()
            .map(|(offset, length)| FileRegion::new(*offset, *length))
    }

    /// Allocate `length` bytes of file space.
    ///
    /// # Errors
    /// Returns [`StorageError::AllocationFailed`] if `length` is zero or the address space is exhausted.
    pub fn allocate(&mut self, length: u64) -> Result<FileRegion, StorageError> {
        if length == 0 {
            return Err(StorageError::AllocationFailed(length));
        }

        let fit = self
            .free
            .iter()
            .find(|(_, free_length)| **free_length >= length)
            .map(|(offset, free_length)| (*offset, *free_length));
        if let Some((offset, free_length)) = fit {
            self.free.remove(&offset);
            if free_length > length {
                self.free.insert(offset + length, free_length - length);
            }
            return Ok(FileRegion::new(offset, length));
        }

        let offset = self.eoa;
        self.eoa = offset
            .checked_add(length)
            .ok_or(StorageError::AllocationFailed(length))?;
        Ok(FileRegion::new(offset, length))
    }

    /// Release a previously allocated region back to the free list.
    ///
    /// # Errors
    /// Returns [`StorageError::FreeFailed`] if `region` is empty, extends beyond the EOA, or overlaps free space.
    pub fn release(&mut self, region: FileRegion) -> Result<(), StorageError> {
        if region.length == 0 || region.end() > self.eoa || !self.is_allocated(region) {
            return Err(StorageError::FreeFailed(region));
        }

        let mut merged = region;
        if let Some((prev_offset, prev_length)) = self
            .free
            .range(..region.offset)
            .next_back()
            .map(|(offset, length)| (*offset, *length))
        {
            if prev_offset + prev_length == region.offset {
                self.free.remove(&prev_offset);
                merged = FileRegion::new(prev_offset, prev_length + merged.length);
            }
        }
        if let Some(next_length) = self.free.remove(&merged.end()) {
            merged.length += next_length;
        }

        if merged.end() == self.eoa {
            self.eoa = merged.offset;
        } else {
            self.free.insert(merged.offset, merged.length);
        }
        Ok(())
    }

    /// Returns true if no part of `region` is in the free list and it lies below the EOA.
    #[must_use]
    pub fn is_allocated(&self, region: FileRegion) -> bool {
        if region.end() > self.eoa {
            return false;
        }
        let before = self
            .free
            .range(..=region.offset)
            .next_back()
            .is_some_and(|(offset, length)| FileRegion::new(*offset, *length).overlaps(&region));
        let within = self.free.range(region.offset..region.end()).next().is_some();
        !before && !within
    }
}
