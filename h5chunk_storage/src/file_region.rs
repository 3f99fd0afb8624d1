//! File regions.
//!
//! A [`FileRegion`] is a contiguous run of bytes in the file address space, identified by its offset and length.

use std::ops::Range;

use thiserror::Error;

use crate::FileAddress;

/// A contiguous region of a file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileRegion {
    /// The offset of the region.
    pub offset: FileAddress,
    /// The length of the region in bytes.
    pub length: u64,
}

/// An invalid file region error.
#[derive(Copy, Clone, Debug, Error)]
#[error("invalid file region {0} for a file of length {1}")]
pub struct InvalidFileRegionError(FileRegion, u64);

impl InvalidFileRegionError {
    /// Create a new [`InvalidFileRegionError`].
    #[must_use]
    pub const fn new(region: FileRegion, file_length: u64) -> Self {
        Self(region, file_length)
    }
}

impl FileRegion {
    /// Create a new file region.
    #[must_use]
    pub const fn new(offset: FileAddress, length: u64) -> Self {
        Self { offset, length }
    }

    /// Return the exclusive end of the region.
    #[must_use]
    pub const fn end(&self) -> FileAddress {
        self.offset + self.length
    }

    /// Return the region as a byte range.
    #[must_use]
    pub const fn to_range(&self) -> Range<u64> {
        self.offset..self.end()
    }

    /// Returns true if `other` overlaps this region.
    #[must_use]
    pub const fn overlaps(&self, other: &FileRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Returns true if `other` is adjacent to the end of this region.
    #[must_use]
    pub const fn abuts(&self, other: &FileRegion) -> bool {
        self.end() == other.offset
    }
}

impl std::fmt::Display for FileRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

impl From<Range<u64>> for FileRegion {
    fn from(range: Range<u64>) -> Self {
        Self::new(range.start, range.end.saturating_sub(range.start))
    }
}
