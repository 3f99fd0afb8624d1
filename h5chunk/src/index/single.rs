use std::ops::ControlFlow;

use h5chunk_storage::FileAddress;
use serde::{Deserialize, Serialize};

use super::{ChunkIndex, ChunkIndexKind, ChunkIndexTraits, ChunkRecord, IndexInfo, StoredChunk};
use crate::{filter::FilterMask, layout::LayoutFlags, ChunkError};

/// A single chunk index.
///
/// The dataset holds at most one chunk, whose record is kept in the layout rather than in index metadata.
/// The length and filter mask of the chunk are only recorded if the chunk is filtered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk: Option<StoredChunk>,
}

fn check_scaled(scaled: &[u64]) -> Result<(), ChunkError> {
    if scaled.iter().all(|&s| s == 0) {
        Ok(())
    } else {
        Err(ChunkError::LookupError(format!(
            "chunk {scaled:?} is outside of a single chunk index"
        )))
    }
}

impl SingleIndex {
    fn stored(info: &IndexInfo<'_>, stored: StoredChunk) -> StoredChunk {
        if info
            .layout
            .flags()
            .contains(LayoutFlags::SINGLE_INDEX_WITH_FILTER)
        {
            stored
        } else {
            StoredChunk {
                offset: stored.offset,
                length: info.layout.size(),
                filter_mask: FilterMask::NONE,
            }
        }
    }
}

impl ChunkIndexTraits for SingleIndex {
    fn kind(&self) -> ChunkIndexKind {
        ChunkIndexKind::Single
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        match info.layout.max_nchunks() {
            Some(1) => Ok(()),
            _ => Err("a single chunk index requires exactly one chunk".into()),
        }
    }

    fn create(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn is_space_alloc(&self) -> bool {
        self.chunk.is_some()
    }

    fn insert(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
        stored: StoredChunk,
    ) -> Result<(), ChunkError> {
        check_scaled(scaled)?;
        self.chunk = Some(Self::stored(info, stored));
        Ok(())
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        check_scaled(scaled)?;
        Ok(self.chunk.map(|stored| Self::stored(info, stored)))
    }

    fn remove(
        &mut self,
        _info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        check_scaled(scaled)?;
        Ok(self.chunk.take())
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        let Some(stored) = self.chunk else {
            return Ok(ControlFlow::Continue(()));
        };
        let record = ChunkRecord::new(
            vec![0; info.layout.dimensionality()],
            Some(Self::stored(info, stored)),
        );
        Ok(f(&record))
    }

    fn resize(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn delete(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        super::release_chunks(info, self.chunk.take())
    }

    fn release_metadata(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        let mut index = SingleIndex::default();
        index.init(dst)?;
        Ok(ChunkIndex::Single(index))
    }

    fn copy_shutdown(&mut self, _dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn size(&self, _info: &IndexInfo<'_>) -> u64 {
        0
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        writeln!(f, "single chunk index")?;
        super::dump_records(f, self.chunk.iter().map(|stored| ("[0]".to_string(), stored)))
    }

    fn header_address(&self) -> Option<FileAddress> {
        self.chunk.map(|stored| stored.offset)
    }
}
