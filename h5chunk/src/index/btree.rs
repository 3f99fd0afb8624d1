use std::{collections::BTreeMap, ops::ControlFlow};

use h5chunk_grid::ArrayIndices;
use h5chunk_storage::FileAddress;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{
    release_chunks, release_metadata_regions, ChunkIndex, ChunkIndexKind, ChunkIndexTraits,
    ChunkRecord, IndexInfo, MetadataRegion, StoredChunk,
};
use crate::{layout::LayoutFlags, ChunkError};

const V1_NODE_SIZE: u64 = 24;
const V2_HEADER_SIZE: u64 = 38;

/// The B-tree version of a [`BTreeIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BTreeVersion {
    /// A version 1 B-tree, which records the length and filter mask of every chunk.
    V1,
    /// A version 2 B-tree.
    V2,
}

/// A B-tree chunk index.
///
/// Records are keyed by chunk coordinates, so any number of unlimited dimensions is supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeIndex {
    version: BTreeVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    header: Option<MetadataRegion>,
    #[serde(
        default,
        serialize_with = "serialize_records",
        deserialize_with = "deserialize_records"
    )]
    records: BTreeMap<ArrayIndices, StoredChunk>,
}

fn serialize_records<S: Serializer>(
    records: &BTreeMap<ArrayIndices, StoredChunk>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(records.iter())
}

fn deserialize_records<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<ArrayIndices, StoredChunk>, D::Error> {
    let records = Vec::<(ArrayIndices, StoredChunk)>::deserialize(deserializer)?;
    Ok(records.into_iter().collect())
}

impl BTreeIndex {
    /// Create a new empty B-tree index.
    #[must_use]
    pub fn new(version: BTreeVersion) -> Self {
        Self {
            version,
            header: None,
            records: BTreeMap::new(),
        }
    }

    /// Return the B-tree version.
    #[must_use]
    pub const fn version(&self) -> BTreeVersion {
        self.version
    }

    fn check_scaled(info: &IndexInfo<'_>, scaled: &[u64]) -> Result<(), ChunkError> {
        let in_bounds = std::iter::zip(scaled, info.layout.max_chunks())
            .all(|(&s, max)| max.is_none_or(|max| s < max));
        if scaled.len() == info.layout.dimensionality() && in_bounds {
            Ok(())
        } else {
            Err(ChunkError::LookupError(format!(
                "chunk {scaled:?} is outside of the b-tree chunk index"
            )))
        }
    }

    fn stored(&self, info: &IndexInfo<'_>, stored: StoredChunk) -> StoredChunk {
        match self.version {
            BTreeVersion::V1 => stored,
            BTreeVersion::V2 => info.stored(stored),
        }
    }

    fn record_size(&self, info: &IndexInfo<'_>) -> u64 {
        let ndims = info.layout.dimensionality() as u64;
        match self.version {
            // chunk size, filter mask, scaled offsets with the element offset, child address
            BTreeVersion::V1 => 4 + 4 + (ndims + 1) * 8 + 8,
            BTreeVersion::V2 => {
                info.record_size() + u64::from(info.layout.enc_bytes_per_dim()) * ndims
            }
        }
    }
}

impl ChunkIndexTraits for BTreeIndex {
    fn kind(&self) -> ChunkIndexKind {
        match self.version {
            BTreeVersion::V1 => ChunkIndexKind::BTreeV1,
            BTreeVersion::V2 => ChunkIndexKind::BTreeV2,
        }
    }

    fn init(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if self.version == BTreeVersion::V1
            && info
                .layout
                .flags()
                .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS)
        {
            return Err(ChunkError::Unsupported(
                "a version 1 b-tree cannot index unfiltered partial edge chunks".to_string(),
            ));
        }
        Ok(())
    }

    fn create(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        if self.header.is_none() {
            let size = match self.version {
                BTreeVersion::V1 => V1_NODE_SIZE,
                BTreeVersion::V2 => V2_HEADER_SIZE,
            };
            self.header = Some(MetadataRegion::allocate(info, size)?);
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
        Self::check_scaled(info, scaled)?;
        self.create(info)?;
        self.records.insert(scaled.to_vec(), stored);
        Ok(())
    }

    fn get_addr(
        &self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        Self::check_scaled(info, scaled)?;
        Ok(self
            .records
            .get(scaled)
            .map(|&stored| self.stored(info, stored)))
    }

    fn remove(
        &mut self,
        info: &IndexInfo<'_>,
        scaled: &[u64],
    ) -> Result<Option<StoredChunk>, ChunkError> {
        Self::check_scaled(info, scaled)?;
        let removed = self.records.remove(scaled);
        Ok(removed.map(|stored| self.stored(info, stored)))
    }

    fn iterate(
        &self,
        info: &IndexInfo<'_>,
        f: &mut dyn FnMut(&ChunkRecord) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>, ChunkError> {
        for (scaled, &stored) in &self.records {
            let record = ChunkRecord::new(scaled.clone(), Some(self.stored(info, stored)));
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
        let records = std::mem::take(&mut self.records);
        release_chunks(
            info,
            records.into_values().map(|stored| self.stored(info, stored)),
        )?;
        self.release_metadata(info)
    }

    fn release_metadata(&mut self, info: &IndexInfo<'_>) -> Result<(), ChunkError> {
        release_metadata_regions(info, self.header.take())
    }

    fn copy_setup(&self, dst: &IndexInfo<'_>) -> Result<ChunkIndex, ChunkError> {
        let mut index = BTreeIndex::new(self.version);
        index.init(dst)?;
        index.create(dst)?;
        Ok(ChunkIndex::BTree(index))
    }

    fn copy_shutdown(&mut self, _dst: &IndexInfo<'_>) -> Result<(), ChunkError> {
        Ok(())
    }

    fn size(&self, info: &IndexInfo<'_>) -> u64 {
        let header = self.header.map_or(0, |header| header.length());
        header + self.records.len() as u64 * self.record_size(info)
    }

    fn dump(&self, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let version = match self.version {
            BTreeVersion::V1 => 1,
            BTreeVersion::V2 => 2,
        };
        match self.header {
            Some(header) => writeln!(
                f,
                "version {version} b-tree chunk index at address {}, {} records",
                header.offset(),
                self.records.len()
            )?,
            None => writeln!(f, "version {version} b-tree chunk index, unallocated")?,
        }
        super::dump_records(
            f,
            self.records
                .iter()
                .map(|(scaled, stored)| (format!("{scaled:?}"), stored)),
        )
    }

    fn header_address(&self) -> Option<FileAddress> {
        self.header.map(|header| header.offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::{FilterMask, FilterPipeline},
        index::tests::{test_file, test_layout},
    };

    #[test]
    fn btree_index_records() -> Result<(), ChunkError> {
        let file = test_file();
        let layout = test_layout(&[4, 6], &[None, None], &[2, 3]);
        let pipeline = FilterPipeline::new();
        let info = IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &pipeline,
        };

        let mut v1 = BTreeIndex::new(BTreeVersion::V1);
        v1.init(&info)?;
        v1.create(&info)?;
        let region = file.allocate(10)?;
        v1.insert(&info, &[7, 2], StoredChunk::new(region, FilterMask::new(1)))?;
        // v1 records always hold the stored length and mask
        assert_eq!(v1.get_addr(&info, &[7, 2])?.unwrap().length, 10);
        assert_eq!(v1.size(&info), V1_NODE_SIZE + 4 + 4 + 3 * 8 + 8);

        let mut v2 = BTreeIndex::new(BTreeVersion::V2);
        v2.init(&info)?;
        v2.insert(&info, &[7, 2], StoredChunk::new(region, FilterMask::new(1)))?;
        assert!(v2.is_space_alloc());
        assert_eq!(v2.get_addr(&info, &[7, 2])?.unwrap().length, 24);
        assert_eq!(v2.size(&info), V2_HEADER_SIZE + 8 + 2);

        let mut visited = 0;
        let flow = v2.iterate(&info, &mut |_| {
            visited += 1;
            ControlFlow::Break(())
        })?;
        assert!(flow.is_break());
        assert_eq!(visited, 1);
        Ok(())
    }

    #[test]
    fn btree_v1_rejects_unfiltered_edge_chunks() {
        let file = test_file();
        let mut layout = test_layout(&[4, 6], &[None, None], &[2, 3]);
        layout.set_flags(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS);
        let pipeline = FilterPipeline::new();
        let info = IndexInfo {
            file: &file,
            layout: &layout,
            pipeline: &pipeline,
        };
        assert!(BTreeIndex::new(BTreeVersion::V1).init(&info).is_err());
    }
}
