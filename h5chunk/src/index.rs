//! Chunk indexes.
//!
//! A chunk index maps the chunk coordinates of a dataset to the file region and filter mask of each stored chunk.
//! The index variant of a dataset is chosen when it is created (see [`ChunkIndexKind::select`]):
//!
//! | variant | used when | index metadata |
//! |---|---|---|
//! | [`None`](ChunkIndex::None) | fixed maximum dimensions, early allocation and no filters | none, chunk addresses are computed |
//! | [`Single`](ChunkIndex::Single) | the dataset can only ever hold one chunk | none, the record is held in the layout |
//! | [`FixedArray`](ChunkIndex::FixedArray) | fixed maximum dimensions | a header and one element per possible chunk |
//! | [`ExtensibleArray`](ChunkIndex::ExtensibleArray) | exactly one unlimited dimension | a header and data blocks that grow along the unlimited dimension |
//! | [`BTree`](ChunkIndex::BTree) | more than one unlimited dimension | a header and one record per stored chunk |
//!
//! Every variant implements [`ChunkIndexTraits`], and [`ChunkIndex`] dispatches to the variant it holds.

mod btree;
mod extensible_array;
mod fixed_array;
mod none;
mod single;

use std::ops::ControlFlow;

use h5chunk_grid::ArrayIndices;
use h5chunk_storage::{FileAddress, FileHandle, FileRegion};
use serde::{Deserialize, Serialize};

pub use btree::{BTreeIndex, BTreeVersion};
pub use extensible_array::ExtensibleArrayIndex;
pub use fixed_array::FixedArrayIndex;
pub use none::NoneIndex;
pub use single::SingleIndex;

use crate::{
    fill::{AllocTime, FillValue},
    filter::{FilterMask, FilterPipeline},
    layout::{ChunkLayout, LayoutFlags},
    ChunkError,
};

/// The file region and filter mask of a stored chunk.
///
/// A stored chunk always has a non-zero length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredChunk {
    /// The file address of the chunk.
    pub offset: FileAddress,
    /// The stored (possibly filtered) length of the chunk.
    pub length: u64,
    /// The filter mask of the chunk.
    pub filter_mask: FilterMask,
}

impl StoredChunk {
    /// Create a stored chunk for a file region.
    #[must_use]
    pub const fn new(region: FileRegion, filter_mask: FilterMask) -> Self {
        Self {
            offset: region.offset,
            length: region.length,
            filter_mask,
        }
    }

    /// Return the file region of the chunk.
    #[must_use]
    pub const fn region(&self) -> FileRegion {
        FileRegion::new(self.offset, self.length)
    }
}

/// A chunk index record: chunk coordinates and, if the chunk is stored, its storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// The chunk coordinates.
    pub scaled: ArrayIndices,
    /// The chunk storage, or [`None`] if the chunk has never been written.
    pub stored: Option<StoredChunk>,
}

impl ChunkRecord {
    /// Create a record for chunk `scaled`.
    #[must_use]
    pub const fn new(scaled: ArrayIndices, stored: Option<StoredChunk>) -> Self {
        Self { scaled, stored }
    }

    /// Returns true if the chunk is stored.
    #[must_use]
    pub const fn is_defined(&self) -> bool {
        self.stored.is_some()
    }

    /// Return the file address of the chunk, if stored.
    #[must_use]
    pub fn offset(&self) -> Option<FileAddress> {
        self.stored.map(|stored| stored.offset)
    }

    /// Return the stored length of the chunk, or zero if it is not stored.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.stored.map_or(0, |stored| stored.length)
    }

    /// Return the filter mask of the chunk.
    #[must_use]
    pub fn filter_mask(&self) -> FilterMask {
        self.stored.map_or(FilterMask::NONE, |stored| stored.filter_mask)
    }
}

/// What a chunk index operates on: the file, the chunk layout, and the filter pipeline of a dataset.
#[derive(Debug, Clone, Copy)]
pub struct IndexInfo<'a> {
    /// The file.
    pub file: &'a FileHandle,
    /// The chunk layout.
    pub layout: &'a ChunkLayout,
    /// The filter pipeline.
    pub pipeline: &'a FilterPipeline,
}

impl IndexInfo<'_> {
    pub(crate) fn allocate(&self, length: u64) -> Result<FileRegion, ChunkError> {
        self.file
            .allocate(length)
            .map_err(|source| ChunkError::AllocationError { length, source })
    }

    /// The size of an array element or B-tree record address, length and filter mask.
    pub(crate) fn record_size(&self) -> u64 {
        if self.pipeline.is_empty() {
            8
        } else {
            8 + 4 + 4
        }
    }

    /// Expand an index element to the chunk it stores.
    ///
    /// Unfiltered array and B-tree elements only record an address.
    pub(crate) fn stored(&self, stored: StoredChunk) -> StoredChunk {
        if self.pipeline.is_empty() {
            StoredChunk {
                offset: stored.offset,
                length: self.layout.size(),
                filter_mask: FilterMask::NONE,
            }
        } else {
            stored
        }
    }
}

/// A chunk index variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkIndexKind {
    /// Chunk addresses are computed from a contiguous allocation.
    None,
    /// A single chunk.
    Single,
    /// A fixed array.
    FixedArray,
    /// An extensible array.
    ExtensibleArray,
    /// A version 1 B-tree.
    BTreeV1,
    /// A version 2 B-tree.
    BTreeV2,
}

impl std::fmt::Display for ChunkIndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Single => "single",
            Self::FixedArray => "fixed array",
            Self::ExtensibleArray => "extensible array",
            Self::BTreeV1 => "v1 b-tree",
            Self::BTreeV2 => "v2 b-tree",
        };
        f.write_str(name)
    }
}

impl ChunkIndexKind {
    /// Select the index variant for a new dataset.
    ///
    /// The chunk grid geometry of `layout` must be set.
    #[must_use]
    pub fn select(layout: &ChunkLayout, pipeline: &FilterPipeline, fill_value: &FillValue) -> Self {
        let kind = match (layout.max_nchunks(), layout.num_unlimited_dims()) {
            (Some(1), _) => Self::Single,
            (_, 0) if fill_value.alloc_time() == AllocTime::Early && pipeline.is_empty() => {
                Self::None
            }
            (_, 0) => Self::FixedArray,
            (_, 1) => Self::ExtensibleArray,
            _ => Self::BTreeV2,
        };
        log::debug!("selected the {kind} chunk index for chunk grid {:?}", layout.max_chunks());
        kind
    }

    /// Check that this variant can index a dataset.
    ///
    /// # Errors
    /// Returns [`ChunkError::Unsupported`] if the variant cannot index chunks of `layout`.
    pub fn check(
        self,
        layout: &ChunkLayout,
        pipeline: &FilterPipeline,
        fill_value: &FillValue,
    ) -> Result<(), ChunkError> {
        let supported = match self {
            Self::None => {
                layout.num_unlimited_dims() == 0
                    && pipeline.is_empty()
                    && fill_value.alloc_time() == AllocTime::Early
            }
            Self::Single => layout.max_nchunks() == Some(1),
            Self::FixedArray => layout.num_unlimited_dims() == 0,
            Self::ExtensibleArray => layout.num_unlimited_dims() == 1,
            Self::BTreeV1 => !layout
                .flags()
                .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS),
            Self::BTreeV2 => true,
        };
        if supported {
            Ok(())
        } else {
            Err(ChunkError::Unsupported(format!(
                "a {self} chunk index cannot index chunk grid {:?} with {} filters",
                layout.max_chunks(),
                pipeline.len()
            )))
        }
    }
}

/// Chunk index traits.
pub trait ChunkIndexTraits {
    /// Return the index variant.
    fn kind(&self) -> ChunkIndexKind;

    /// Prepare the index of an existing or new dataset. Calling this more than once has no further effect.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if the index is inconsistent with the chunk layout.
    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Allocate the index metadata of a new dataset.
    ///
    /// # Errors
    /// Returns [`ChunkError::AllocationError`] if file space cannot be allocated.
    fn create(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Returns true if the index metadata has been allocated.
    fn is_space_alloc(&self) -> bool;

    /// Record that chunk `scaled` is stored in `stored`, replacing any previous record.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the chunk is outside of the index or the index does not record insertions.
    fn insert(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
        stored: StoredChunk,
    ) -> Result<(), ChunkError>;

    /// Return the storage of chunk `scaled`, or [`None`] if it has never been written.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if the index is inconsistent.
    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError>;

    /// Remove the record of chunk `scaled` and return it.
    ///
    /// The chunk's file space is not released.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if the index is inconsistent.
    fn remove(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError>;

    /// Visit every stored chunk until `f` breaks.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if the index is inconsistent.
    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError>;

    /// Update the index after the chunk grid geometry changed.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if stored chunks fall outside of the new geometry.
    fn resize(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Release the file space of every stored chunk and of the index metadata, leaving an empty unallocated index.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if file space cannot be released.
    fn delete(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Release the file space of the index metadata only, leaving stored chunks in place.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if file space cannot be released.
    fn release_metadata(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Create an empty index of the same variant in the destination of a copy.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the destination index cannot be created.
    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError>;

    /// Finish a copy into this (destination) index.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the destination index is inconsistent.
    fn copy_shutdown(&mut self, dst: &IndexInfo<'_>) -> Result<(), ChunkError>;

    /// Return the number of bytes of index metadata.
    fn size(&self, info: &IndexInfo<'_>) -> u64;

    /// Write a human readable listing of the index.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result;

    /// Return the address of the index metadata.
    fn header_address(&self) -> Option<FileAddress>;
}

/// A chunk index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkIndex {
    /// Chunk addresses are computed from a contiguous allocation.
    None(NoneIndex),
    /// A single chunk.
    Single(SingleIndex),
    /// A fixed array.
    FixedArray(FixedArrayIndex),
    /// An extensible array.
    ExtensibleArray(ExtensibleArrayIndex),
    /// A B-tree.
    BTree(BTreeIndex),
}

impl ChunkIndex {
    /// Create a new empty index of variant `kind`.
    #[must_use]
    pub fn new(kind: ChunkIndexKind) -> Self {
        match kind {
            ChunkIndexKind::None => Self::None(NoneIndex::default()),
            ChunkIndexKind::Single => Self::Single(SingleIndex::default()),
            ChunkIndexKind::FixedArray => Self::FixedArray(FixedArrayIndex::default()),
            ChunkIndexKind::ExtensibleArray => {
                Self::ExtensibleArray(ExtensibleArrayIndex::default())
            }
            ChunkIndexKind::BTreeV1 => Self::BTree(BTreeIndex::new(BTreeVersion::V1)),
            ChunkIndexKind::BTreeV2 => Self::BTree(BTreeIndex::new(BTreeVersion::V2)),
        }
    }

    /// Return every stored chunk.
    ///
    /// # Errors
    /// Returns [`ChunkError::LookupError`] if the index is inconsistent.
    pub fn records(&self, info: &IndexInfo<'_>) -> Result<Vec<ChunkRecord>, ChunkError> {
        let mut records = Vec::new();
        self.iterate(info, &mut |record| {
            records.push(record.clone());
            ControlFlow::Continue(())
        })?;
        Ok(records)
    }
}

macro_rules! dispatch {
    ($self:ident, $index:ident => $expr:expr) => {
        match $self {
            Self::None($index) => $expr,
            Self::Single($index) => $expr,
            Self::FixedArray($index) => $expr,
            Self::ExtensibleArray($index) => $expr,
            Self::BTree($index) => $expr,
        }
    };
}

impl ChunkIndexTraits for ChunkIndex {
    fn kind(&self) -> ChunkIndexKind {
        dispatch!(self, index => index.kind())
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.init(info))
    }

    fn create(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.create(info))
    }

    fn is_space_alloc(&self) -> bool {
        dispatch!(self, index => index.is_space_alloc())
    }

    fn insert(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
        stored: StoredChunk,
    ) -> Result<(), ChunkError> {
        dispatch!(self, index => index.insert(info, scaled, stored))
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        dispatch!(self, index => index.get_addr(info, scaled))
    }

    fn remove(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        dispatch!(self, index => index.remove(info, scaled))
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        dispatch!(self, index => index.iterate(info, f))
    }

    fn resize(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.resize(info))
    }

    fn delete(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.delete(info))
    }

    fn release_metadata(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.release_metadata(info))
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        dispatch!(self, index => index.copy_setup(dst))
    }

    fn copy_shutdown(&mut self, dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        dispatch!(self, index => index.copy_shutdown(dst))
    }

    fn size(&self, info: &IndexInfo<'_>) -> u64 {
        dispatch!(self, index => index.size(info))
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        dispatch!(self, index => index.dump(f))
    }

    fn header_address(&self) -> Option<FileAddress> {
        dispatch!(self, index => index.header_address())
    }
}

/// Release the file space of every chunk in `chunks`, reporting the first failure after attempting all.
pub(crate) fn release_chunks(
    info: &IndexInfo<'_>,
    chunks: impl IntoIterator<Item = StoredChunk>,
) -> Result<(), ChunkError> {
    let mut result = Ok(());
    for stored in chunks {
        if let Err(err) = info.file.release(stored.region()) {
            log::warn!("unable to release chunk {}: {err}", stored.region());
            if result.is_ok() {
                result = Err(err.into());
            }
        }
    }
    result
}

/// A region of index metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MetadataRegion {
    offset: FileAddress,
    length: u64,
}

impl MetadataRegion {
    pub(crate) fn allocate(info: &IndexInfo<'_>, length: u64) -> Result<Self, ChunkError> {
        let region = info.allocate(length)?;
        Ok(Self {
            offset: region.offset,
            length: region.length,
        })
    }

    pub(crate) const fn offset(&self) -> FileAddress {
        self.offset
    }

    pub(crate) const fn length(&self) -> u64 {
        self.length
    }
}

/// Release index metadata regions.
pub(crate) fn release_metadata_regions(
    info: &IndexInfo<'_>,
    regions: impl IntoIterator<Item = MetadataRegion>,
) -> Result<(), ChunkError> {
    for region in regions {
        info.file
            .release(FileRegion::new(region.offset, region.length))?;
    }
    Ok(())
}

/// Write the records of an index in a listing.
pub(crate) fn dump_records<'a>(
    f: &mut dyn std::fmt::Write,
    records: impl IntoIterator<Item = (String, &'a StoredChunk)>,
) -> std::fmt::Result {
    for (key, stored) in records {
        writeln!(
            f,
            "  {key}: address {} length {} filter mask {}",
            stored.offset, stored.length, stored.filter_mask
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use h5chunk_storage::{store::MemoryBlockStore, FileIntent};

    use super::*;
    use crate::fill::FillTime;

    pub(super) fn test_file() -> FileHandle {
        FileHandle::new_with_space(
            Arc::new(MemoryBlockStore::new()),
            h5chunk_storage::FreeSpaceManager::new(0),
            FileIntent::read_write(),
        )
    }

    pub(super) fn test_layout(
        dims: &[u64],
        max_dims: &[Option<u64>],
        chunk_shape: &[u64],
    ) -> ChunkLayout {
        let mut layout = ChunkLayout::new(chunk_shape.to_vec(), 4, LayoutFlags::empty())
            .expect("valid chunk shape");
        layout.set_info(dims, max_dims).expect("valid dims");
        layout
    }

    #[test]
    fn chunk_index_kind_select() {
        let pipeline = FilterPipeline::new();
        let fill = FillValue::default();
        let early = FillValue::default().with_alloc_time(AllocTime::Early);
        let layout = test_layout(&[4, 4], &[Some(4), Some(4)], &[4, 4]);
        assert_eq!(ChunkIndexKind::select(&layout, &pipeline, &fill), ChunkIndexKind::Single);
        let layout = test_layout(&[8, 8], &[Some(8), Some(8)], &[4, 4]);
        assert_eq!(ChunkIndexKind::select(&layout, &pipeline, &fill), ChunkIndexKind::FixedArray);
        assert_eq!(ChunkIndexKind::select(&layout, &pipeline, &early), ChunkIndexKind::None);
        let filtered = FilterPipeline::new().with_fletcher32();
        assert_eq!(ChunkIndexKind::select(&layout, &filtered, &early), ChunkIndexKind::FixedArray);
        let layout = test_layout(&[8, 8], &[None, Some(8)], &[4, 4]);
        assert_eq!(
            ChunkIndexKind::select(&layout, &pipeline, &fill),
            ChunkIndexKind::ExtensibleArray
        );
        let layout = test_layout(&[8, 8], &[None, None], &[4, 4]);
        assert_eq!(ChunkIndexKind::select(&layout, &pipeline, &fill), ChunkIndexKind::BTreeV2);
        assert!(ChunkIndexKind::FixedArray.check(&layout, &pipeline, &fill).is_err());
        assert!(ChunkIndexKind::BTreeV1.check(&layout, &pipeline, &fill).is_ok());
        assert!(ChunkIndexKind::None
            .check(&layout, &pipeline, &fill.with_fill_time(FillTime::Alloc))
            .is_err());
    }

    #[test]
    fn chunk_index_serde() -> Result<(), Box<dyn std::error::Error>> {
        let file = test_file();
        let layout = test_layout(&[8, 8], &[None, None], &[4, 4]);
        let pipeline = FilterPipeline::new().with_fletcher32();
        let info = IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &pipeline,
        };
        let mut index = ChunkIndex::new(ChunkIndexKind::BTreeV2);
        index.init(&info)?;
        index.create(&info)?;
        let stored = StoredChunk::new(info.allocate(20)?, FilterMask::new(1));
        index.insert(&info, &[1, 0], stored)?;
        let json = serde_json::to_string(&index)?;
        let index: ChunkIndex = serde_json::from_str(&json)?;
        assert_eq!(index.kind(), ChunkIndexKind::BTreeV2);
        assert_eq!(index.get_addr(&info, &[1, 0])?, Some(stored));
        assert_eq!(index.records(&info)?, vec![ChunkRecord::new(vec![1, 0], Some(stored))]);
        Ok(())
    }
}
