use std::{collections::BTreeMap, ops::ControlFlow};

use h5chunk_grid::{linearise, unravel_index};
use h5chunk_storage::FileAddress;
use serde::{Deserialize, Serialize};

use super::{
    release_chunks, release_metadata_regions, ChunkIndex, ChunkIndexKind, ChunkIndexTraits,
    ChunkRecord, IndexInfo, MetadataRegion, StoredChunk,
};
use crate::ChunkError;

const HEADER_SIZE: u64 = 28;
const DATA_BLOCK_PREFIX_SIZE: u64 = 18;

/// A fixed array chunk index.
///
/// Holds one element per chunk of the maximum dataset extent, addressed by the linear index of the chunk in the maximum chunk grid.
/// The header is allocated on creation and the data block on the first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedArrayIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    header: Option<MetadataRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_block: Option<MetadataRegion>,
    #[serde(default)]
    elements: BTreeMap<u64, StoredChunk>,
}

impl FixedArrayIndex {
    fn key(info: &IndexInfo<'_>, scaled: &[u64]) -> Result<u64, ChunkError> {
        let down = info
            .layout
            .max_down_chunks()
            .ok_or_else(|| ChunkError::from("a fixed array chunk index requires fixed maximum dimensions"))?;
        let in_bounds = std::iter::zip(scaled, info.layout.max_chunks())
            .all(|(&s, max)| max.is_some_and(|max| s < max));
        if scaled.len() != down.len() || !in_bounds {
            return Err(ChunkError::LookupError(format!(
                "chunk {scaled:?} is outside of the fixed array chunk index"
            )));
        }
        Ok(linearise(scaled, down))
    }

    fn data_block_size(info: &IndexInfo<'_>) -> u64 {
        DATA_BLOCK_PREFIX_SIZE + info.layout.max_nchunks().unwrap_or(0) * info.record_size()
    }
}

impl ChunkIndexTraits for FixedArrayIndex {
    fn kind(&self) -> ChunkIndexKind {
        ChunkIndexKind::FixedArray
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if info.layout.max_nchunks().is_none() {
            return Err("a fixed array chunk index requires fixed maximum dimensions".into());
        }
        Ok(())
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
        let key = Self::key(info, scaled)?;
        self.create(info)?;
        if self.data_block.is_none() {
            self.data_block = Some(MetadataRegion::allocate(info, Self::data_block_size(info))?);
        }
        self.elements.insert(key, stored);
        Ok(())
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        let key = Self::key(info, scaled)?;
        Ok(self.elements.get(&key).map(|&stored| info.stored(stored)))
    }

    fn remove(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        let key = Self::key(info, scaled)?;
        Ok(self.elements.remove(&key).map(|stored| info.stored(stored)))
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        let max_chunks = info
            .layout
            .max_chunks()
            .iter()
            .copied()
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| ChunkError::from("a fixed array chunk index requires fixed maximum dimensions"))?;
        for (&key, &stored) in &self.elements {
            let scaled = unravel_index(key, &max_chunks).ok_or_else(|| {
                ChunkError::LookupError(format!("fixed array element {key} is out of bounds"))
            })?;
            let record = ChunkRecord::new(scaled.to_vec(), Some(info.stored(stored)));
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
        release_metadata_regions(info, self.data_block.take().into_iter().chain(self.header.take()))
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        let mut index = FixedArrayIndex::default();
        index.init(dst)?;
        index.create(dst)?;
        Ok(ChunkIndex::FixedArray(index))
    }

    fn copy_shutdown(&mut self, _dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn size(&self, _info: &IndexInfo<'_>) -> u64 {
        self.header
            .iter()
            .chain(&self.data_block)
            .map(MetadataRegion::length)
            .sum()
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self.header {
            Some(header) => writeln!(f, "fixed array chunk index at address {}", header.offset())?,
            None => writeln!(f, "fixed array chunk index, unallocated")?,
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
