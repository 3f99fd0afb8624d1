use std::ops::ControlFlow;

use h5chunk_grid::{iterators::ChunkOdometer, linearise};
use h5chunk_storage::{FileAddress, FileRegion};
use serde::{Deserialize, Serialize};

use super::{ChunkIndex, ChunkIndexKind, ChunkIndexTraits, ChunkRecord, IndexInfo, StoredChunk};
use crate::{filter::FilterMask, ChunkError};

/// An implicit chunk index.
///
/// Storage for every chunk of the maximum dataset extent is allocated contiguously when the index is created,
/// and the address of a chunk is computed from its linear index in the maximum chunk grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoneIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base: Option<FileAddress>,
    #[serde(default)]
    length: u64,
}

impl NoneIndex {
    fn max_down_chunks<'a>(info: &'a IndexInfo<'_>) -> Result<&'a [u64], ChunkError> {
        info.layout
            .max_down_chunks()
            .ok_or_else(|| "an implicit chunk index requires fixed maximum dimensions".into())
    }

    fn address(&self, info: &IndexInfo<'_>, scaled: &[u64]) -> Result<Option<StoredChunk>, ChunkError> {
        let Some(base) = self.base else {
            return Ok(None);
        };
        let down = Self::max_down_chunks(info)?;
        let offset = base + linearise(scaled, down) * info.layout.size();
        if offset + info.layout.size() > base + self.length {
            return Err(ChunkError::LookupError(format!(
                "chunk {scaled:?} is outside of the implicit chunk index"
            )));
        }
        Ok(Some(StoredChunk {
            offset,
            length: info.layout.size(),
            filter_mask: FilterMask::NONE,
        }))
    }
}

impl ChunkIndexTraits for NoneIndex {
    fn kind(&self) -> ChunkIndexKind {
        ChunkIndexKind::None
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Self::max_down_chunks(info)?;
        if !info.pipeline.is_empty() {
            return Err("an implicit chunk index cannot hold filtered chunks".into());
        }
        Ok(())
    }

    fn create(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if self.base.is_some() {
            return Ok(());
        }
        let max_nchunks = info
            .layout
            .max_nchunks()
            .ok_or_else(|| ChunkError::from("an implicit chunk index requires fixed maximum dimensions"))?;
        let length = max_nchunks * info.layout.size();
        if length == 0 {
            return Ok(());
        }
        let region = info.allocate(length)?;
        log::debug!("allocated {region} for an implicit chunk index of {max_nchunks} chunks");
        self.base = Some(region.offset);
        self.length = region.length;
        Ok(())
    }

    fn is_space_alloc(&self) -> bool {
        self.base.is_some()
    }

    fn insert(
        &mut self,
        _info: &IndexInfo<'_>,
        _scaled: &[u64],
        _stored: StoredChunk,
    ) -> Result<(), ChunkError> {
        Err(ChunkError::Unsupported(
            "chunks cannot be inserted into an implicit chunk index".to_string(),
        ))
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        self.address(info, scaled)
    }

    fn remove(
        &mut self,
        _info: &IndexInfo<'_>,
        _scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        Ok(None)
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        if self.base.is_none() {
            return Ok(ControlFlow::Continue(()));
        }
        let max_chunks = info
            .layout
            .max_chunks()
            .iter()
            .map(|max| max.and_then(|max| max.checked_sub(1)))
            .collect::<Option<Vec<u64>>>()
            .ok_or_else(|| ChunkError::from("an implicit chunk index requires fixed maximum dimensions"))?;
        for scaled in ChunkOdometer::new(vec![0; max_chunks.len()], max_chunks) {
            let stored = self.address(info, &scaled)?;
            if f(&ChunkRecord::new(scaled, stored)).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn resize(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn delete(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if let Some(base) = self.base.take() {
            info.file.release(FileRegion::new(base, self.length))?;
            self.length = 0;
        }
        Ok(())
    }

    fn release_metadata(&mut self, _info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        let mut index = NoneIndex::default();
        index.init(dst)?;
        index.create(dst)?;
        Ok(ChunkIndex::None(index))
    }

    fn copy_shutdown(&mut self, _dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn size(&self, _info: &IndexInfo<'_>) -> u64 {
        0
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        match self.base {
            Some(base) => writeln!(f, "implicit chunk index at address {base} length {}", self.length),
            None => writeln!(f, "implicit chunk index, unallocated"),
        }
    }

    fn header_address(&self) -> Option<FileAddress> {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filter::FilterPipeline, index::tests::{test_file, test_layout}};

    #[test]
    fn none_index_addresses() -> Result<(), ChunkError> {
        let file = test_file();
        let layout = test_layout(&[4, 6], &[Some(8), Some(6)], &[2, 3]);
        let pipeline = FilterPipeline::new();
        let info = IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &pipeline,
        };
        let mut index = NoneIndex::default();
        index.init(&info)?;
        assert_eq!(index.get_addr(&info, &[0, 0])?, None);
        index.create(&info)?;
        assert_eq!(file.eoa(), 8 * 24);
        let stored = index.get_addr(&info, &[3, 1])?.unwrap();
        assert_eq!(stored.offset, 7 * 24);
        assert_eq!(stored.length, 24);
        assert!(index.insert(&info, &[0, 0], stored).is_err());
        assert_eq!(index.remove(&info, &[3, 1])?, None);
        let mut count = 0;
        index.iterate(&info, &mut |record| {
            assert!(record.is_defined());
            count += 1;
            ControlFlow::Continue(())
        })?;
        assert_eq!(count, 8);
        index.delete(&info)?;
        assert_eq!(file.eoa(), 0);
        Ok(())
    }
}
