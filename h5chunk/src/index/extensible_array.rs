use std::{collections::BTreeMap, ops::ControlFlow};

use h5chunk_grid::{down_strides, linearise};
use h5chunk_storage::FileAddress;
use serde::{Deserialize, Serialize};

use super::{
    release_chunks, release_metadata_regions, ChunkIndex, ChunkIndexKind, ChunkIndexTraits,
    ChunkRecord, IndexInfo, MetadataRegion, StoredChunk,
};
use crate::ChunkError;

const HEADER_SIZE: u64 = 58;
const DATA_BLOCK_PREFIX_SIZE: u64 = 16;
const DATA_BLOCK_ELEMENTS: u64 = 64;

/// An extensible array chunk index.
///
/// Indexes datasets with exactly one unlimited dimension.
/// Chunk coordinates are swizzled so that the unlimited dimension is outermost, then linearised, so that extending the dataset only appends elements.
/// Data blocks of a fixed number of elements are allocated as the array grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensibleArrayIndex {
    #[serde(default)]
    unlimited_dim: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    header: Option<MetadataRegion>,
    #[serde(default)]
    data_blocks: Vec<MetadataRegion>,
    #[serde(default)]
    elements: BTreeMap<u64, StoredChunk>,
}

impl ExtensibleArrayIndex {
    /// The chunk grid with the unlimited dimension moved to the front, and its strides.
    fn swizzled_down(&self, info: &IndexInfo<'_>) -> Result<Vec<u64>, ChunkError> {
        let mut max_chunks = info.layout.max_chunks().to_vec();
        if self.unlimited_dim >= max_chunks.len() {
            return Err("the unlimited dimension of an extensible array is out of bounds".into());
        }
        let unlimited = max_chunks.remove(self.unlimited_dim);
        let fixed = max_chunks
            .into_iter()
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| ChunkError::from("an extensible array chunk index supports one unlimited dimension"))?;
        let mut shape = vec![unlimited.unwrap_or(u64::MAX)];
        shape.extend(fixed);
        Ok(down_strides(&shape))
    }

    fn key(&self, info: &IndexInfo<'_>, scaled: &[u64]) -> Result<u64, ChunkError> {
        let down = self.swizzled_down(info)?;
        let in_bounds = std::iter::zip(scaled, info.layout.max_chunks())
            .all(|(&s, max)| max.is_none_or(|max| s < max));
        if scaled.len() != down.len() || !in_bounds {
            return Err(ChunkError::LookupError(format!(
                "chunk {scaled:?} is outside of the extensible array chunk index"
            )));
        }
        let mut swizzled = scaled.to_vec();
        let unlimited = swizzled.remove(self.unlimited_dim);
        swizzled.insert(0, unlimited);
        Ok(linearise(&swizzled, &down))
    }

    fn scaled(&self, down: &[u64], mut key: u64) -> Vec<u64> {
        let mut swizzled = Vec::with_capacity(down.len());
        for &stride in down {
            swizzled.push(key / stride);
            key %= stride;
        }
        let unlimited = swizzled.remove(0);
        swizzled.insert(self.unlimited_dim, unlimited);
        swizzled
    }

    fn data_block_size(info: &IndexInfo<'_>) -> u64 {
        DATA_BLOCK_PREFIX_SIZE + DATA_BLOCK_ELEMENTS * info.record_size()
    }
}

impl ChunkIndexTraits for ExtensibleArrayIndex {
    fn kind(&self) -> ChunkIndexKind {
        ChunkIndexKind::ExtensibleArray
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        let mut unlimited = info
            .layout
            .max_dims()
            .iter()
            .enumerate()
            .filter(|(_, max)| max.is_none())
            .map(|(dim, _)| dim);
        match (unlimited.next(), unlimited.next()) {
            (Some(dim), None) => {
                self.unlimited_dim = dim;
                Ok(())
            }
            _ => Err("an extensible array chunk index requires exactly one unlimited dimension".into()),
        }
    }

    fn create(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if self.header.is_none() {
            self.header = Some(MetadataRegion::allocate(info, HEADER_SIZE)?);
        }
        Ok(())
    }

    fn is_space_alloc(&self) -> bool {
        self.header.is_some()
    }

    fn insert(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
        stored: StoredChunk,
    ) -> Result<(), ChunkError> {
        let key = self.key(info, scaled)?;
        self.create(info)?;
        while (self.data_blocks.len() as u64) * DATA_BLOCK_ELEMENTS <= key {
            let block = MetadataRegion::allocate(info, Self::data_block_size(info))?;
            log::trace!("extensible array data block {} at {}", self.data_blocks.len(), block.offset());
            self.data_blocks.push(block);
        }
        self.elements.insert(key, stored);
        Ok(())
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        let key = self.key(info, scaled)?;
        Ok(self.elements.get(&key).map(|&stored| info.stored(stored)))
    }

    fn remove(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        let key = self.key(info, scaled)?;
        Ok(self.elements.remove(&key).map(|stored| info.stored(stored)))
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        if self.elements.is_empty() {
            return Ok(ControlFlow::Continue(()));
        }
        let down = self.swizzled_down(info)?;
        for (&key, &stored) in &self.elements {
            let record = ChunkRecord::new(self.scaled(&down, key), Some(info.stored(stored)));
            if f(&record).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn resize(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn delete(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        let elements = std::mem::take(&mut self.elements);
        release_chunks(info, elements.into_values().map(|stored| info.stored(stored)))?;
        self.release_metadata(info)
    }

    fn release_metadata(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        let blocks = std::mem::take(&mut self.data_blocks);
        release_metadata_regions(info, blocks.into_iter().rev().chain(self.header.take()))
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        let mut index = ExtensibleArrayIndex::default();
        index.init(dst)?;
        index.create(dst)?;
        Ok(ChunkIndex::ExtensibleArray(index))
    }

    fn copy_shutdown(&mut self, _dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn size(&self, _info: &IndexInfo<'_>) -> u64 {
        self.header
            .iter()
            .chain(&self.data_blocks)
            .map(MetadataRegion::length)
            .sum()
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self.header {
            Some(header) => writeln!(
                f,
                "extensible array chunk index at address {}, unlimited dimension {}, {} data blocks",
                header.offset(),
                self.unlimited_dim,
                self.data_blocks.len()
            )?,
            None => writeln!(f, "extensible array chunk index, unallocated")?,
        }
        super::dump_records(
            f,
            self.elements
                .iter()
                .map(|(key, stored)| (format!("[{key}]"), stored)),
        )
    }

    fn header_address(&self) -> Option<FileAddress> {
        self.header.map(|header| header.offset())
    }
}
