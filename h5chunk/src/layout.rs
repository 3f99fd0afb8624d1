//! The chunk layout of a dataset.
//!
//! A [`ChunkLayout`] holds the chunk shape and element size, which are fixed at dataset creation, and the chunk grid geometry, which is recomputed by [`ChunkLayout::set_info`] whenever the current or maximum dataset dimensions change.

use bitflags::bitflags;
use h5chunk_grid::{
    down_strides, linearise, log2_floor, ArrayIndices, ArrayShape, ArraySubset,
    IncompatibleDimensionalityError,
};
use serde::{Deserialize, Serialize};

use crate::ChunkError;

/// The largest chunk size in bytes.
pub const MAX_CHUNK_SIZE: u64 = 0xffff_ffff;

bitflags! {
    /// Chunk layout flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LayoutFlags: u8 {
        /// Partial edge chunks are stored without applying the filter pipeline.
        const DONT_FILTER_PARTIAL_BOUND_CHUNKS = 0x01;
        /// The single chunk of a single chunk index is filtered, so its length and filter mask are recorded.
        const SINGLE_INDEX_WITH_FILTER = 0x02;
    }
}

/// The chunk layout and chunk grid geometry of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_shape: ArrayShape,
    element_size: u64,
    size: u64,
    size_usize: usize,
    flags: LayoutFlags,
    enc_bytes_per_dim: u8,
    dims: ArrayShape,
    max_dims: Vec<Option<u64>>,
    chunks: ArrayShape,
    max_chunks: Vec<Option<u64>>,
    nchunks: u64,
    max_nchunks: Option<u64>,
    down_chunks: Vec<u64>,
    max_down_chunks: Option<Vec<u64>>,
}

impl ChunkLayout {
    /// Create a new chunk layout.
    ///
    /// The chunk grid geometry is empty until [`set_info`](Self::set_info) is called.
    ///
    /// # Errors
    /// Returns [`ChunkError::InvalidChunkShape`] if the chunk shape is empty or has a zero extent, or the element size is zero.
    /// Returns [`ChunkError::ChunkTooLarge`] if a chunk is larger than [`MAX_CHUNK_SIZE`].
    pub fn new(
        chunk_shape: ArrayShape,
        element_size: u64,
        flags: LayoutFlags,
    ) -> Result<Self, ChunkError> {
        if chunk_shape.is_empty() {
            return Err(ChunkError::InvalidChunkShape(
                "a chunk must have at least one dimension".to_string(),
            ));
        }
        if chunk_shape.contains(&0) || element_size == 0 {
            return Err(ChunkError::InvalidChunkShape(format!(
                "chunk shape {chunk_shape:?} with element size {element_size} has a zero extent"
            )));
        }
        let size = chunk_shape
            .iter()
            .try_fold(element_size, |acc, &dim| acc.checked_mul(dim))
            .filter(|&size| size <= MAX_CHUNK_SIZE)
            .ok_or_else(|| {
                ChunkError::ChunkTooLarge(
                    chunk_shape
                        .iter()
                        .fold(element_size, |acc, &dim| acc.saturating_mul(dim)),
                )
            })?;
        let size_usize = usize::try_from(size).map_err(|_| ChunkError::ChunkTooLarge(size))?;
        let enc_bytes_per_dim = chunk_shape
            .iter()
            .chain(std::iter::once(&element_size))
            .map(|&dim| (log2_floor(dim) + 8) / 8)
            .max()
            .unwrap_or(1);
        let ndims = chunk_shape.len();
        Ok(Self {
            chunk_shape,
            element_size,
            size,
            size_usize,
            flags,
            enc_bytes_per_dim: u8::try_from(enc_bytes_per_dim).unwrap_or(8),
            dims: vec![0; ndims],
            max_dims: vec![Some(0); ndims],
            chunks: vec![0; ndims],
            max_chunks: vec![Some(0); ndims],
            nchunks: 0,
            max_nchunks: Some(0),
            down_chunks: vec![0; ndims],
            max_down_chunks: Some(vec![0; ndims]),
        })
    }

    /// Return the chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    /// Return the element size in bytes.
    #[must_use]
    pub const fn element_size(&self) -> u64 {
        self.element_size
    }

    /// Return the decoded chunk size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Return the decoded chunk size in bytes as a [`usize`].
    #[must_use]
    pub const fn size_usize(&self) -> usize {
        self.size_usize
    }

    /// Return the number of elements in a chunk.
    #[must_use]
    pub fn chunk_elements(&self) -> u64 {
        self.chunk_shape.iter().product()
    }

    /// Return the layout flags.
    #[must_use]
    pub const fn flags(&self) -> LayoutFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: LayoutFlags) {
        self.flags = flags;
    }

    /// Return the number of bytes used to encode each chunk dimension in B-tree records.
    #[must_use]
    pub const fn enc_bytes_per_dim(&self) -> u8 {
        self.enc_bytes_per_dim
    }

    /// Return the dimensionality.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.chunk_shape.len()
    }

    /// Recompute the chunk grid geometry for the current dimensions `dims` and maximum dimensions `max_dims`.
    ///
    /// A [`None`] maximum dimension is unlimited.
    ///
    /// # Errors
    /// Returns [`ChunkError::IncompatibleDimensionality`] if the dimensionalities differ, or [`ChunkError::InvalidExtent`] if a current dimension exceeds its maximum.
    pub fn set_info(&mut self, dims: &[u64], max_dims: &[Option<u64>]) -> Result<(), ChunkError> {
        let ndims = self.dimensionality();
        for len in [dims.len(), max_dims.len()] {
            if len != ndims {
                return Err(IncompatibleDimensionalityError::new(len, ndims).into());
            }
        }
        if let Some((dim, max)) =
            std::iter::zip(dims, max_dims).find(|(dim, max)| matches!(max, Some(max) if *dim > max))
        {
            return Err(ChunkError::InvalidExtent(format!(
                "dimension {dim} exceeds its maximum {max:?}"
            )));
        }
        self.dims = dims.to_vec();
        self.max_dims = max_dims.to_vec();
        self.chunks = std::iter::zip(dims, &self.chunk_shape)
            .map(|(&dim, &chunk)| dim.div_ceil(chunk))
            .collect();
        self.max_chunks = std::iter::zip(max_dims, &self.chunk_shape)
            .map(|(max, &chunk)| max.map(|max| max.div_ceil(chunk)))
            .collect();
        self.nchunks = self.chunks.iter().product();
        self.max_nchunks = self
            .max_chunks
            .iter()
            .try_fold(1u64, |acc, max| max.and_then(|max| acc.checked_mul(max)));
        self.down_chunks = down_strides(&self.chunks);
        self.max_down_chunks = self
            .max_chunks
            .iter()
            .copied()
            .collect::<Option<Vec<u64>>>()
            .map(|max_chunks| down_strides(&max_chunks));
        Ok(())
    }

    /// Return the current dataset dimensions.
    #[must_use]
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// Return the maximum dataset dimensions, [`None`] is unlimited.
    #[must_use]
    pub fn max_dims(&self) -> &[Option<u64>] {
        &self.max_dims
    }

    /// Return the number of unlimited dimensions.
    #[must_use]
    pub fn num_unlimited_dims(&self) -> usize {
        self.max_dims.iter().filter(|max| max.is_none()).count()
    }

    /// Return the number of chunks along each dimension.
    #[must_use]
    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    /// Return the maximum number of chunks along each dimension, [`None`] is unlimited.
    #[must_use]
    pub fn max_chunks(&self) -> &[Option<u64>] {
        &self.max_chunks
    }

    /// Return the number of chunks.
    #[must_use]
    pub const fn nchunks(&self) -> u64 {
        self.nchunks
    }

    /// Return the maximum number of chunks, or [`None`] if a dimension is unlimited.
    #[must_use]
    pub const fn max_nchunks(&self) -> Option<u64> {
        self.max_nchunks
    }

    /// Return the row-major strides of the current chunk grid.
    #[must_use]
    pub fn down_chunks(&self) -> &[u64] {
        &self.down_chunks
    }

    /// Return the row-major strides of the maximum chunk grid, or [`None`] if a dimension is unlimited.
    #[must_use]
    pub fn max_down_chunks(&self) -> Option<&[u64]> {
        self.max_down_chunks.as_deref()
    }

    /// Return the chunk coordinates of the chunk holding the element at `indices`.
    #[must_use]
    pub fn scaled(&self, indices: &[u64]) -> ArrayIndices {
        std::iter::zip(indices, &self.chunk_shape)
            .map(|(&i, &chunk)| i / chunk)
            .collect()
    }

    /// Return the element indices of the origin of chunk `scaled`.
    #[must_use]
    pub fn chunk_origin(&self, scaled: &[u64]) -> ArrayIndices {
        std::iter::zip(scaled, &self.chunk_shape)
            .map(|(&s, &chunk)| s * chunk)
            .collect()
    }

    /// Return the linear index of chunk `scaled` in the current chunk grid.
    #[must_use]
    pub fn linear_index(&self, scaled: &[u64]) -> u64 {
        linearise(scaled, &self.down_chunks)
    }

    /// Return the region of the dataset covered by chunk `scaled`, clipped to the current dimensions.
    #[must_use]
    pub fn chunk_subset(&self, scaled: &[u64]) -> ArraySubset {
        ArraySubset::from(
            itertools::izip!(scaled, &self.chunk_shape, &self.dims).map(|(&s, &chunk, &dim)| {
                let start = std::cmp::min(s * chunk, dim);
                start..std::cmp::min(start + chunk, dim)
            }),
        )
    }

    /// Returns true if chunk `scaled` is only partially covered by the current dimensions.
    #[must_use]
    pub fn is_partial_edge_chunk(&self, scaled: &[u64]) -> bool {
        self.is_partial_edge_chunk_in(scaled, &self.dims)
    }

    /// Returns true if chunk `scaled` is only partially covered by dimensions `dims`.
    #[must_use]
    pub fn is_partial_edge_chunk_in(&self, scaled: &[u64], dims: &[u64]) -> bool {
        itertools::izip!(scaled, &self.chunk_shape, dims)
            .any(|(&s, &chunk, &dim)| (s + 1) * chunk > dim)
    }

    /// Returns true if chunk `scaled` is stored without filters because it is a partial edge chunk.
    #[must_use]
    pub fn is_unfiltered_edge_chunk(&self, scaled: &[u64]) -> bool {
        self.flags
            .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS)
            && self.is_partial_edge_chunk(scaled)
    }
}
