//! Chunked datasets.

use std::{ops::ControlFlow, sync::Arc};

use bytes::Bytes;
use h5chunk_grid::{
    ArrayIndices, ArrayShape, ArraySubset, Dataspace, IncompatibleDimensionalityError,
};
use h5chunk_storage::{FileAddress, FileHandle, StorageError};
use serde::{Deserialize, Serialize};

use crate::{
    allocator::file_alloc,
    cache::{CacheStats, ChunkCache, ChunkCacheConfig},
    collective::{DistributedWriteCoordinator, SingleProcess},
    context::ChunkContext,
    extent,
    fill::{AllocTime, FillValue},
    filter::{FilterMask, FilterMessage, FilterOptions, FilterPipeline},
    index::{ChunkIndex, ChunkIndexKind, ChunkIndexTraits, ChunkRecord, IndexInfo, StoredChunk},
    io,
    layout::{ChunkLayout, LayoutFlags},
    mapper::ChunkMap,
    ChunkError,
};

fn to_usize(value: u64) -> Result<usize, ChunkError> {
    usize::try_from(value)
        .map_err(|_| ChunkError::Unsupported(format!("{value} exceeds the address space")))
}

/// The layout flags a chunk index of variant `kind` needs.
fn index_flags(flags: LayoutFlags, kind: ChunkIndexKind, pipeline: &FilterPipeline) -> LayoutFlags {
    match kind {
        ChunkIndexKind::Single if !pipeline.is_empty() => {
            flags | LayoutFlags::SINGLE_INDEX_WITH_FILTER
        }
        ChunkIndexKind::BTreeV1 => flags - LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS,
        _ => flags,
    }
}

/// The persisted description of a chunked dataset: its extent, chunk layout, fill value, filter pipeline, and chunk index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMessage {
    /// The current dataset dimensions.
    pub shape: ArrayShape,
    /// The maximum dataset dimensions, [`None`] is unlimited.
    pub max_shape: Vec<Option<u64>>,
    /// The chunk shape.
    pub chunk_shape: ArrayShape,
    /// The element size in bytes.
    pub element_size: u64,
    /// The layout flags.
    #[serde(default)]
    pub flags: LayoutFlags,
    /// The fill value.
    pub fill_value: FillValue,
    /// The filter pipeline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterMessage>,
    /// The chunk index.
    pub index: ChunkIndex,
}

/// The physical storage of a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// The element offset of the chunk origin.
    pub offset: ArrayIndices,
    /// The filter mask.
    pub filter_mask: FilterMask,
    /// The file address.
    pub address: FileAddress,
    /// The stored size in bytes.
    pub size: u64,
}

/// A [`ChunkedDataset`] builder.
///
/// [`ChunkedDatasetBuilder`] is initialised from a dataset shape, chunk shape, and element size.
///  - The maximum shape is the dataset shape (the dataset cannot grow).
///  - The fill value is the default (zero) fill value, allocated incrementally.
///  - The filter pipeline is empty and no layout flags are set.
///  - The chunk index variant is selected from the chunk grid with [`ChunkIndexKind::select`].
///  - The chunk cache is configured from the [global configuration](crate::config::global_config).
///
/// Use the methods in the builder to change the configuration away from these defaults, and then create the dataset in a file with [`ChunkedDatasetBuilder::build`].
#[derive(Debug, Clone)]
pub struct ChunkedDatasetBuilder {
    shape: ArrayShape,
    max_shape: Option<Vec<Option<u64>>>,
    chunk_shape: ArrayShape,
    element_size: u64,
    flags: LayoutFlags,
    fill_value: FillValue,
    filters: FilterPipeline,
    index_kind: Option<ChunkIndexKind>,
    cache_config: Option<ChunkCacheConfig>,
    filter_options: Option<FilterOptions>,
    coordinator: Arc<dyn DistributedWriteCoordinator>,
}

impl ChunkedDatasetBuilder {
    /// Create a new dataset builder.
    #[must_use]
    pub fn new(shape: ArrayShape, chunk_shape: ArrayShape, element_size: u64) -> Self {
        Self {
            shape,
            max_shape: None,
            chunk_shape,
            element_size,
            flags: LayoutFlags::empty(),
            fill_value: FillValue::default(),
            filters: FilterPipeline::new(),
            index_kind: None,
            cache_config: None,
            filter_options: None,
            coordinator: Arc::new(SingleProcess),
        }
    }

    /// Set the maximum shape. A [`None`] dimension is unlimited.
    pub fn max_shape(&mut self, max_shape: Vec<Option<u64>>) -> &mut Self {
        self.max_shape = Some(max_shape);
        self
    }

    /// Set the layout flags.
    pub fn flags(&mut self, flags: LayoutFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the fill value.
    pub fn fill_value(&mut self, fill_value: FillValue) -> &mut Self {
        self.fill_value = fill_value;
        self
    }

    /// Set the filter pipeline.
    pub fn filters(&mut self, filters: FilterPipeline) -> &mut Self {
        self.filters = filters;
        self
    }

    /// Set the chunk index variant rather than selecting it from the chunk grid.
    pub fn index_kind(&mut self, index_kind: ChunkIndexKind) -> &mut Self {
        self.index_kind = Some(index_kind);
        self
    }

    /// Set the chunk cache configuration.
    pub fn cache_config(&mut self, cache_config: ChunkCacheConfig) -> &mut Self {
        self.cache_config = Some(cache_config);
        self
    }

    /// Set the filter options.
    pub fn filter_options(&mut self, filter_options: FilterOptions) -> &mut Self {
        self.filter_options = Some(filter_options);
        self
    }

    /// Set the coordinator of collective writes, used when the file is open with the parallel intent.
    pub fn coordinator(&mut self, coordinator: Arc<dyn DistributedWriteCoordinator>) -> &mut Self {
        self.coordinator = coordinator;
        self
    }

    /// Create the dataset in `file`.
    ///
    /// With early allocation every chunk of the dataset is allocated (and filled if required) immediately.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if
    ///  - the shapes are inconsistent or a chunk dimension exceeds a fixed maximum dimension,
    ///  - the fill value is not one element long,
    ///  - the selected index variant cannot index the chunk grid,
    ///  - the file is read only, or
    ///  - early allocation fails.
    pub fn build(&self, file: FileHandle) -> Result<ChunkedDataset, ChunkError> {
        if !file.intent().read_write {
            return Err(ChunkError::ReadOnly);
        }
        let ndims = self.chunk_shape.len();
        let max_shape = self
            .max_shape
            .clone()
            .unwrap_or_else(|| self.shape.iter().copied().map(Some).collect());
        for len in [self.shape.len(), max_shape.len()] {
            if len != ndims {
                return Err(IncompatibleDimensionalityError::new(len, ndims).into());
            }
        }
        for (&dim, max, &chunk) in itertools::izip!(&self.shape, &max_shape, &self.chunk_shape) {
            if let Some(max) = max {
                if dim != 0 && chunk > *max {
                    return Err(ChunkError::InvalidChunkShape(format!(
                        "chunk dimension {chunk} exceeds the fixed maximum dimension {max}"
                    )));
                }
            }
        }
        self.fill_value.validate(to_usize(self.element_size)?)?;

        let mut layout = ChunkLayout::new(self.chunk_shape.clone(), self.element_size, self.flags)?;
        layout.set_info(&self.shape, &max_shape)?;
        let kind = self.index_kind.unwrap_or_else(|| {
            ChunkIndexKind::select(&layout, &self.filters, &self.fill_value)
        });
        layout.set_flags(index_flags(layout.flags(), kind, &self.filters));
        kind.check(&layout, &self.filters, &self.fill_value)?;

        let mut index = ChunkIndex::new(kind);
        let info = IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &self.filters,
        };
        index.init(&info)?;
        if self.fill_value.alloc_time() == AllocTime::Early {
            index.create(&info)?;
        }
        let cache_config = self.cache_config.unwrap_or_default();
        let cache = ChunkCache::new(cache_config, &layout);
        log::debug!(
            "created a {kind} chunked dataset of shape {:?} with chunks {:?}",
            layout.dims(),
            layout.chunk_shape()
        );

        let mut dataset = ChunkedDataset {
            file,
            layout,
            pipeline: self.filters.clone(),
            fill_value: self.fill_value.clone(),
            index,
            cache,
            options: self.filter_options.unwrap_or_default(),
            coordinator: self.coordinator.clone(),
        };
        if dataset.fill_value.alloc_time() == AllocTime::Early {
            let zeros = vec![0; ndims];
            let coordinator = dataset.coordinator.clone();
            let (mut ctx, cache) = dataset.parts();
            extent::chunk_allocate(&mut ctx, cache, &zeros, coordinator.as_ref())?;
        }
        Ok(dataset)
    }
}

/// A chunked dataset.
///
/// A chunked dataset partitions its elements into chunks of a fixed shape, each stored in its own region of a file and located through a [chunk index](crate::index).
/// Chunks pass through the [raw data chunk cache](crate::cache) on their way to and from the file.
///
/// A chunked dataset is created with a [`ChunkedDatasetBuilder`] or reopened from its [`DatasetMessage`] with [`ChunkedDataset::open`].
/// Dropping a dataset writes its dirty cached chunks; use [`ChunkedDataset::close`] to observe failures.
#[derive(Debug)]
pub struct ChunkedDataset {
    file: FileHandle,
    layout: ChunkLayout,
    pipeline: FilterPipeline,
    fill_value: FillValue,
    index: ChunkIndex,
    cache: ChunkCache,
    options: FilterOptions,
    coordinator: Arc<dyn DistributedWriteCoordinator>,
}

impl ChunkedDataset {
    /// Open a dataset in `file` from its persisted `message`.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the message is inconsistent or its filter pipeline cannot be created.
    pub fn open(
        file: FileHandle,
        message: DatasetMessage,
        cache_config: ChunkCacheConfig,
    ) -> Result<Self, ChunkError> {
        let DatasetMessage {
            shape,
            max_shape,
            chunk_shape,
            element_size,
            flags,
            fill_value,
            filters,
            mut index,
        } = message;
        let mut layout = ChunkLayout::new(chunk_shape, element_size, flags)?;
        layout.set_info(&shape, &max_shape)?;
        fill_value.validate(to_usize(element_size)?)?;
        let pipeline = FilterPipeline::from_messages(&filters, to_usize(element_size)?)?;
        index.kind().check(&layout, &pipeline, &fill_value)?;
        index.init(&IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &pipeline,
        })?;
        let cache = ChunkCache::new(cache_config, &layout);
        log::debug!("opened a {} chunked dataset of shape {shape:?}", index.kind());
        Ok(Self {
            file,
            layout,
            pipeline,
            fill_value,
            index,
            cache,
            options: FilterOptions::default(),
            coordinator: Arc::new(SingleProcess),
        })
    }

    /// Set the coordinator of collective writes.
    pub fn set_coordinator(&mut self, coordinator: Arc<dyn DistributedWriteCoordinator>) {
        self.coordinator = coordinator;
    }

    /// Set the filter options.
    pub fn set_filter_options(&mut self, options: FilterOptions) {
        self.options = options;
    }

    /// Return the persisted description of the dataset.
    ///
    /// The chunk index reflects chunks written so far, [`flush`](Self::flush) first to include cached chunks.
    #[must_use]
    pub fn message(&self) -> DatasetMessage {
        DatasetMessage {
            shape: self.layout.dims().to_vec(),
            max_shape: self.layout.max_dims().to_vec(),
            chunk_shape: self.layout.chunk_shape().to_vec(),
            element_size: self.layout.element_size(),
            flags: self.layout.flags(),
            fill_value: self.fill_value.clone(),
            filters: self.pipeline.messages(),
            index: self.index.clone(),
        }
    }

    /// Return the file.
    #[must_use]
    pub const fn file(&self) -> &FileHandle {
        &self.file
    }

    /// Return the chunk layout.
    #[must_use]
    pub const fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Return the current dataset dimensions.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        self.layout.dims()
    }

    /// Return the fill value.
    #[must_use]
    pub const fn fill_value(&self) -> &FillValue {
        &self.fill_value
    }

    /// Return the filter pipeline.
    #[must_use]
    pub const fn filters(&self) -> &FilterPipeline {
        &self.pipeline
    }

    /// Return the chunk index.
    #[must_use]
    pub const fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Return the chunk cache.
    #[must_use]
    pub const fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    fn info(&self) -> IndexInfo<'_> {
        IndexInfo {
            file: &self.file,
            layout: &self.layout,
            pipeline: &self.pipeline,
        }
    }

    fn parts(&mut self) -> (ChunkContext<'_>, &mut ChunkCache) {
        (
            ChunkContext {
                file: &self.file,
                layout: &self.layout,
                pipeline: &self.pipeline,
                fill: &self.fill_value,
                index: &mut self.index,
                options: self.options,
            },
            &mut self.cache,
        )
    }

    fn check_writable(&self) -> Result<(), ChunkError> {
        if self.file.intent().read_write {
            Ok(())
        } else {
            Err(ChunkError::ReadOnly)
        }
    }

    fn check_buffer(&self, mem_space: &Dataspace, len: usize) -> Result<(), ChunkError> {
        let expected = to_usize(mem_space.extent_elements() * self.layout.element_size())?;
        if len == expected {
            Ok(())
        } else {
            Err(ChunkError::InvalidBufferSize { got: len, expected })
        }
    }

    /// Return the chunk coordinates of the chunk with origin `offset`.
    fn aligned_chunk(&self, offset: &[u64]) -> Result<ArrayIndices, ChunkError> {
        let ndims = self.layout.dimensionality();
        if offset.len() != ndims {
            return Err(IncompatibleDimensionalityError::new(offset.len(), ndims).into());
        }
        if std::iter::zip(offset, self.layout.dims()).any(|(&i, &dim)| i >= dim) {
            return Err(ChunkError::ChunkNotFound(offset.to_vec()));
        }
        if std::iter::zip(offset, self.layout.chunk_shape()).any(|(&i, &chunk)| i % chunk != 0) {
            return Err(ChunkError::Unsupported(format!(
                "offset {offset:?} is not aligned to chunk shape {:?}",
                self.layout.chunk_shape()
            )));
        }
        Ok(self.layout.scaled(offset))
    }

    /// Read the elements of `file_space` into the elements of `mem_space`.
    ///
    /// `buf` holds the whole extent of `mem_space`, elements outside of its selection are untouched.
    /// Elements of chunks that were never written read as the fill value unless the fill value policy skips missing chunks.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the selections are incompatible with the dataset or each other, `buf` has the wrong size, or chunk I/O fails.
    pub fn read(
        &mut self,
        file_space: &Dataspace,
        mem_space: &Dataspace,
        buf: &mut [u8],
    ) -> Result<(), ChunkError> {
        self.check_buffer(mem_space, buf.len())?;
        let parallel = self.file.intent().parallel;
        let map = ChunkMap::new(&self.layout, file_space, mem_space, parallel)?;
        let (mut ctx, cache) = self.parts();
        io::read(&mut ctx, cache, &map, buf)
    }

    /// Write the elements of `mem_space` to the elements of `file_space`.
    ///
    /// `buf` holds the whole extent of `mem_space`.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the file is read only, the selections are incompatible with the dataset or each other, `buf` has the wrong size, or chunk I/O fails.
    pub fn write(
        &mut self,
        file_space: &Dataspace,
        mem_space: &Dataspace,
        buf: &[u8],
    ) -> Result<(), ChunkError> {
        self.check_writable()?;
        self.check_buffer(mem_space, buf.len())?;
        let parallel = self.file.intent().parallel;
        let map = ChunkMap::new(&self.layout, file_space, mem_space, parallel)?;
        let (mut ctx, cache) = self.parts();
        io::write(&mut ctx, cache, &map, buf)
    }

    /// Read the elements of `subset` in C order.
    ///
    /// # Errors
    /// See [`read`](Self::read).
    pub fn read_subset(&mut self, subset: &ArraySubset) -> Result<Vec<u8>, ChunkError> {
        let file_space = Dataspace::new_with_subset(self.shape().to_vec(), subset)?;
        let mem_space = Dataspace::new(subset.shape().to_vec());
        let mut buf = vec![0; to_usize(subset.num_elements() * self.layout.element_size())?];
        self.read(&file_space, &mem_space, &mut buf)?;
        Ok(buf)
    }

    /// Write the elements of `subset` in C order.
    ///
    /// # Errors
    /// See [`write`](Self::write).
    pub fn write_subset(&mut self, subset: &ArraySubset, bytes: &[u8]) -> Result<(), ChunkError> {
        let file_space = Dataspace::new_with_subset(self.shape().to_vec(), subset)?;
        let mem_space = Dataspace::new(subset.shape().to_vec());
        self.write(&file_space, &mem_space, bytes)
    }

    /// Change the current dataset dimensions.
    ///
    /// Growing allocates the exposed chunks under early allocation and refilters former partial edge chunks that became complete.
    /// Shrinking removes the chunks outside the new extent and fills the out of bounds elements of the chunks that straddle it.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the file is read only, `dims` exceeds the maximum dimensions, or chunk I/O fails.
    pub fn set_extent(&mut self, dims: &[u64]) -> Result<(), ChunkError> {
        self.check_writable()?;
        let old_dims = self.layout.dims().to_vec();
        if dims.len() != old_dims.len() {
            return Err(IncompatibleDimensionalityError::new(dims.len(), old_dims.len()).into());
        }
        if dims == old_dims.as_slice() {
            return Ok(());
        }
        let max_dims = self.layout.max_dims().to_vec();
        self.layout.set_info(dims, &max_dims)?;
        log::debug!("extent changed from {old_dims:?} to {dims:?}");

        let grown = std::iter::zip(dims, &old_dims).any(|(new, old)| new > old);
        let shrunk = std::iter::zip(dims, &old_dims).any(|(new, old)| new < old);
        let early = self.fill_value.alloc_time() == AllocTime::Early;
        let coordinator = self.coordinator.clone();
        let (mut ctx, cache) = self.parts();
        let info = ctx.info();
        ctx.index.resize(&info)?;
        cache.update(&mut ctx)?;
        if grown {
            if early {
                extent::chunk_allocate(&mut ctx, cache, &old_dims, coordinator.as_ref())?;
            }
            extent::update_old_edge_chunks(&mut ctx, cache, &old_dims)?;
        }
        if shrunk {
            extent::prune_by_extent(&mut ctx, cache, &old_dims)?;
        }
        Ok(())
    }

    /// Write every dirty cached chunk.
    ///
    /// # Errors
    /// Returns the first [`ChunkError`] encountered, after attempting every chunk.
    pub fn flush(&mut self) -> Result<(), ChunkError> {
        let (mut ctx, cache) = self.parts();
        cache.flush(&mut ctx)
    }

    /// Write and evict every cached chunk and return the persisted description of the dataset.
    ///
    /// # Errors
    /// Returns the first [`ChunkError`] encountered, after attempting every chunk.
    pub fn close(mut self) -> Result<DatasetMessage, ChunkError> {
        let (mut ctx, cache) = self.parts();
        cache.dest(&mut ctx)?;
        Ok(self.message())
    }

    /// Return the chunk cache statistics, logging them at debug level.
    pub fn stats(&self) -> CacheStats {
        let stats = *self.cache.stats();
        log::debug!(
            "chunk cache: {} hits, {} misses, {} inits, {} flushes, {} evictions, {} of {} bytes in {} entries",
            stats.hits,
            stats.misses,
            stats.inits,
            stats.flushes,
            stats.evictions,
            self.cache.nbytes_used(),
            self.cache.config().nbytes(),
            self.cache.nused()
        );
        stats
    }

    fn stored_records(&mut self) -> Result<Vec<ChunkRecord>, ChunkError> {
        self.flush()?;
        let mut records = self.index.records(&self.info())?;
        records.retain(ChunkRecord::is_defined);
        Ok(records)
    }

    fn chunk_info_of(&self, scaled: &[u64], stored: StoredChunk) -> ChunkInfo {
        ChunkInfo {
            offset: self.layout.chunk_origin(scaled),
            filter_mask: stored.filter_mask,
            address: stored.offset,
            size: stored.length,
        }
    }

    /// Return the number of bytes of file space used by stored chunks.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if flushing the cache or iterating the chunk index fails.
    pub fn allocated_bytes(&mut self) -> Result<u64, ChunkError> {
        Ok(self
            .stored_records()?
            .iter()
            .map(ChunkRecord::length)
            .sum())
    }

    /// Return the number of stored chunks.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if flushing the cache or iterating the chunk index fails.
    pub fn num_chunks(&mut self) -> Result<u64, ChunkError> {
        Ok(self.stored_records()?.len() as u64)
    }

    /// Return the storage of the `n`th stored chunk in chunk index order, or [`None`] if fewer chunks are stored.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if flushing the cache or iterating the chunk index fails.
    pub fn chunk_info(&mut self, n: u64) -> Result<Option<ChunkInfo>, ChunkError> {
        let records = self.stored_records()?;
        let record = usize::try_from(n).ok().and_then(|n| records.get(n));
        Ok(record.and_then(|record| {
            record
                .stored
                .map(|stored| self.chunk_info_of(&record.scaled, stored))
        }))
    }

    /// Return the storage of the chunk containing element `offset`, or [`None`] if it is not stored.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if `offset` is outside of the dataset or the chunk index lookup fails.
    pub fn chunk_info_by_coord(&mut self, offset: &[u64]) -> Result<Option<ChunkInfo>, ChunkError> {
        let ndims = self.layout.dimensionality();
        if offset.len() != ndims {
            return Err(IncompatibleDimensionalityError::new(offset.len(), ndims).into());
        }
        if std::iter::zip(offset, self.layout.dims()).any(|(&i, &dim)| i >= dim) {
            return Err(ChunkError::ChunkNotFound(offset.to_vec()));
        }
        let scaled = self.layout.scaled(offset);
        {
            let (mut ctx, cache) = self.parts();
            cache.flush_chunk(&mut ctx, &scaled)?;
        }
        let stored = self.index.get_addr(&self.info(), &scaled)?;
        Ok(stored.map(|stored| self.chunk_info_of(&scaled, stored)))
    }

    /// Visit every stored chunk until `f` breaks.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if flushing the cache or iterating the chunk index fails.
    pub fn iterate(
        &mut self,
        mut f: impl FnMut(&ChunkInfo) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        self.flush()?;
        let info = self.info();
        self.index.iterate(&info, &mut |record| match record.stored {
            Some(stored) => f(&self.chunk_info_of(&record.scaled, stored)),
            None => ControlFlow::Continue(()),
        })
    }

    /// Return the file address of every chunk of the current extent by linear chunk index, [`None`] if unallocated.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if flushing the cache or iterating the chunk index fails.
    pub fn addr_map(&mut self) -> Result<Vec<Option<FileAddress>>, ChunkError> {
        let records = self.stored_records()?;
        let mut addrs = vec![None; to_usize(self.layout.nchunks())?];
        let chunks = self.layout.chunks();
        for record in records {
            if std::iter::zip(&record.scaled, chunks).any(|(&s, &n)| s >= n) {
                continue;
            }
            let linear = to_usize(self.layout.linear_index(&record.scaled))?;
            if let Some(addr) = addrs.get_mut(linear) {
                *addr = record.offset();
            }
        }
        Ok(addrs)
    }

    /// Release the file space of every chunk and of the chunk index, discarding cached chunks.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the file is read only or file space cannot be released.
    pub fn delete_storage(&mut self) -> Result<(), ChunkError> {
        self.check_writable()?;
        let (mut ctx, cache) = self.parts();
        cache.discard(&mut ctx)?;
        let info = ctx.info();
        ctx.index.delete(&info)?;
        log::debug!("deleted the storage of a {} chunked dataset", ctx.index.kind());
        Ok(())
    }

    /// Write the stored bytes of the chunk with origin `offset`, bypassing the filter pipeline and the chunk cache.
    ///
    /// `bytes` must already be encoded by the steps of the filter pipeline not excluded by `filter_mask`.
    /// Any cached copy of the chunk is discarded.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if
    ///  - the file is read only,
    ///  - `offset` is not the origin of a chunk of the dataset,
    ///  - `bytes` is empty, or is not a whole chunk for a dataset without filters, or
    ///  - file space allocation or writing fails.
    pub fn direct_write(
        &mut self,
        offset: &[u64],
        filter_mask: FilterMask,
        bytes: &[u8],
    ) -> Result<(), ChunkError> {
        self.check_writable()?;
        let scaled = self.aligned_chunk(offset)?;
        let chunk_size = self.layout.size_usize();
        if bytes.is_empty() || (self.pipeline.is_empty() && bytes.len() != chunk_size) {
            return Err(ChunkError::InvalidBufferSize {
                got: bytes.len(),
                expected: chunk_size,
            });
        }
        let length = bytes.len() as u64;
        let (mut ctx, cache) = self.parts();
        cache.evict_chunk(&mut ctx, &scaled, false)?;
        let info = ctx.info();
        let old = ctx.index.get_addr(&info, &scaled)?;
        let (address, need_insert) = file_alloc(&mut ctx, old, length, &scaled)?;
        ctx.file.write(address, bytes)?;
        let stored = StoredChunk {
            offset: address,
            length,
            filter_mask,
        };
        if need_insert || old.is_some_and(|old| old.filter_mask != filter_mask) {
            let info = ctx.info();
            ctx.index.insert(&info, &scaled, stored)?;
        }
        cache.update_last(&ctx, &scaled, Some(stored));
        log::trace!("direct write of chunk {scaled:?} to {}", stored.region());
        Ok(())
    }

    /// Read the stored bytes and filter mask of the chunk with origin `offset`, bypassing the filter pipeline.
    ///
    /// A dirty cached copy of the chunk is written first.
    ///
    /// # Errors
    /// Returns [`ChunkError::ChunkNotFound`] if the chunk is not stored, or another [`ChunkError`] if `offset` is not the origin of a chunk or I/O fails.
    pub fn direct_read(&mut self, offset: &[u64]) -> Result<(FilterMask, Bytes), ChunkError> {
        let scaled = self.aligned_chunk(offset)?;
        {
            let (mut ctx, cache) = self.parts();
            cache.flush_chunk(&mut ctx, &scaled)?;
        }
        let stored = self
            .index
            .get_addr(&self.info(), &scaled)?
            .ok_or_else(|| ChunkError::ChunkNotFound(offset.to_vec()))?;
        Ok((stored.filter_mask, self.file.read(stored.region())?))
    }

    /// Convert the chunk index to variant `kind`.
    ///
    /// Every stored chunk keeps its file space and is recorded in a new index, the metadata of the old index is released.
    /// Converting to a [version 1 B-tree](ChunkIndexKind::BTreeV1), which cannot record unfiltered partial edge chunks, filters them.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the file is read only, `kind` cannot index the dataset, either index is implicit, or I/O fails.
    pub fn format_convert(&mut self, kind: ChunkIndexKind) -> Result<(), ChunkError> {
        self.check_writable()?;
        let old_kind = self.index.kind();
        if kind == old_kind {
            return Ok(());
        }
        if kind == ChunkIndexKind::None || old_kind == ChunkIndexKind::None {
            return Err(ChunkError::Unsupported(format!(
                "cannot convert a {old_kind} chunk index to a {kind} chunk index"
            )));
        }
        let mut layout = self.layout.clone();
        layout.set_flags(index_flags(layout.flags(), kind, &self.pipeline));
        kind.check(&layout, &self.pipeline, &self.fill_value)?;
        {
            let (mut ctx, cache) = self.parts();
            cache.dest(&mut ctx)?;
        }

        let old_info = IndexInfo {
            file: &self.file,
            layout: &self.layout,
            pipeline: &self.pipeline,
        };
        let info = IndexInfo {
            file: &self.file,
            layout: &layout,
            pipeline: &self.pipeline,
        };
        let records = self.index.records(&old_info)?;
        let mut index = ChunkIndex::new(kind);
        index.init(&info)?;
        index.create(&info)?;
        let mut nfiltered = 0_u64;
        for record in records {
            let Some(mut stored) = record.stored else {
                continue;
            };
            if !self.pipeline.is_empty()
                && self.layout.is_unfiltered_edge_chunk(&record.scaled)
                && !layout.is_unfiltered_edge_chunk(&record.scaled)
            {
                let raw = self.file.read(stored.region())?;
                let (encoded, filter_mask) = self.pipeline.apply(raw.to_vec(), &self.options)?;
                self.file.release(stored.region())?;
                let region = info.allocate(encoded.len() as u64)?;
                self.file.write(region.offset, &encoded)?;
                stored = StoredChunk::new(region, filter_mask);
                nfiltered += 1;
            }
            index.insert(&info, &record.scaled, stored)?;
        }
        self.index.release_metadata(&old_info)?;
        self.index = index;
        self.layout = layout;
        self.cache.reset_last();
        log::debug!("converted a {old_kind} chunk index to a {kind} chunk index, filtering {nfiltered} edge chunks");
        Ok(())
    }

    /// Write one JSON line per stored chunk record to `writer`.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if iterating the chunk index or writing fails.
    pub fn dump_index(&mut self, mut writer: impl std::io::Write) -> Result<(), ChunkError> {
        for record in self.stored_records()? {
            serde_json::to_writer(&mut writer, &record)
                .map_err(|err| StorageError::from(std::io::Error::from(err)))?;
            writer.write_all(b"\n").map_err(StorageError::from)?;
        }
        Ok(())
    }

    /// Return a human readable listing of the chunk index.
    #[must_use]
    pub fn describe_index(&self) -> String {
        let mut listing = String::new();
        if let Err(err) = self.index.dump(&mut listing) {
            log::warn!("unable to describe the chunk index: {err}");
        }
        listing
    }

    /// Copy the dataset into `dst`, returning the copy.
    ///
    /// Every stored chunk is written to newly allocated file space in `dst` and recorded in a new index of the same variant.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if `dst` is read only, or flushing the cache or I/O fails.
    pub fn copy_to(&mut self, dst: FileHandle) -> Result<Self, ChunkError> {
        if !dst.intent().read_write {
            return Err(ChunkError::ReadOnly);
        }
        let records = self.stored_records()?;
        let dst_info = IndexInfo {
            file: &dst,
            layout: &self.layout,
            pipeline: &self.pipeline,
        };
        let mut index = self.index.copy_setup(&dst_info)?;
        for record in &records {
            let Some(stored) = record.stored else {
                continue;
            };
            let bytes = self.file.read(stored.region())?;
            if index.kind() == ChunkIndexKind::None {
                let dst_stored = index
                    .get_addr(&dst_info, &record.scaled)?
                    .ok_or_else(|| ChunkError::ChunkNotFound(record.scaled.clone()))?;
                dst.write(dst_stored.offset, &bytes)?;
            } else {
                let region = dst_info.allocate(stored.length)?;
                dst.write(region.offset, &bytes)?;
                index.insert(
                    &dst_info,
                    &record.scaled,
                    StoredChunk::new(region, stored.filter_mask),
                )?;
            }
        }
        index.copy_shutdown(&dst_info)?;
        log::debug!("copied {} chunks", records.len());
        Ok(Self {
            file: dst,
            layout: self.layout.clone(),
            pipeline: self.pipeline.clone(),
            fill_value: self.fill_value.clone(),
            index,
            cache: ChunkCache::new(*self.cache.config(), &self.layout),
            options: self.options,
            coordinator: self.coordinator.clone(),
        })
    }
}

impl Drop for ChunkedDataset {
    fn drop(&mut self) {
        let (mut ctx, cache) = self.parts();
        if let Err(err) = cache.dest(&mut ctx) {
            log::warn!("unable to flush the chunk cache of a dropped dataset: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use h5chunk_storage::{store::MemoryBlockStore, FileIntent, FreeSpaceManager};

    use super::*;

    fn test_file() -> FileHandle {
        FileHandle::new_with_space(
            Arc::new(MemoryBlockStore::new()),
            FreeSpaceManager::new(0),
            FileIntent::read_write(),
        )
    }

    #[test]
    fn builder_rejects_chunk_larger_than_fixed_max() {
        let builder = ChunkedDatasetBuilder::new(vec![4], vec![8], 1);
        assert!(matches!(
            builder.build(test_file()),
            Err(ChunkError::InvalidChunkShape(_))
        ));
        let builder = ChunkedDatasetBuilder::new(vec![4, 4], vec![2], 1);
        assert!(matches!(
            builder.build(test_file()),
            Err(ChunkError::IncompatibleDimensionality(_))
        ));
    }

    #[test]
    fn builder_selects_index() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = ChunkedDatasetBuilder::new(vec![8, 8], vec![4, 4], 4).build(test_file())?;
        assert_eq!(dataset.index().kind(), ChunkIndexKind::FixedArray);
        let dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 4)
            .max_shape(vec![None])
            .build(test_file())?;
        assert_eq!(dataset.index().kind(), ChunkIndexKind::ExtensibleArray);
        let dataset = ChunkedDatasetBuilder::new(vec![4], vec![4], 4)
            .filters(FilterPipeline::new().with_fletcher32())
            .build(test_file())?;
        assert_eq!(dataset.index().kind(), ChunkIndexKind::Single);
        assert!(dataset
            .layout()
            .flags()
            .contains(LayoutFlags::SINGLE_INDEX_WITH_FILTER));
        Ok(())
    }

    #[test]
    fn read_only_file() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryBlockStore::new());
        let file = FileHandle::new(store.clone(), FileIntent::read_write())?;
        let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 1).build(file)?;
        dataset.write_subset(&ArraySubset::new_with_ranges(&[2..3]), &[7])?;
        let message = dataset.close()?;
        let file = FileHandle::new(store, FileIntent::read_only())?;
        let mut dataset = ChunkedDataset::open(file, message, ChunkCacheConfig::default())?;
        let subset = ArraySubset::new_with_shape(vec![8]);
        assert_eq!(dataset.read_subset(&subset)?, vec![0, 0, 7, 0, 0, 0, 0, 0]);
        assert!(matches!(
            dataset.write_subset(&subset, &[1; 8]),
            Err(ChunkError::ReadOnly)
        ));
        Ok(())
    }

    #[test]
    fn buffer_size_checked() -> Result<(), Box<dyn std::error::Error>> {
        let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 2).build(test_file())?;
        let subset = ArraySubset::new_with_shape(vec![8]);
        assert!(matches!(
            dataset.write_subset(&subset, &[0; 8]),
            Err(ChunkError::InvalidBufferSize {
                got: 8,
                expected: 16
            })
        ));
        Ok(())
    }

    #[test]
    fn direct_write_requires_chunk_origin() -> Result<(), Box<dyn std::error::Error>> {
        let mut dataset = ChunkedDatasetBuilder::new(vec![8], vec![4], 1).build(test_file())?;
        assert!(dataset.direct_write(&[2], FilterMask::NONE, &[0; 4]).is_err());
        assert!(dataset.direct_write(&[8], FilterMask::NONE, &[0; 4]).is_err());
        assert!(dataset.direct_write(&[4], FilterMask::NONE, &[0; 3]).is_err());
        dataset.direct_write(&[4], FilterMask::NONE, &[1, 2, 3, 4])?;
        let (filter_mask, bytes) = dataset.direct_read(&[4])?;
        assert_eq!(filter_mask, FilterMask::NONE);
        assert_eq!(bytes.to_vec(), vec![1, 2, 3, 4]);
        assert!(matches!(
            dataset.direct_read(&[0]),
            Err(ChunkError::ChunkNotFound(_))
        ));
        Ok(())
    }
}
