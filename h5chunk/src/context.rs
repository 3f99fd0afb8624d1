use h5chunk_storage::FileHandle;

use crate::{
    fill::FillValue,
    filter::{FilterOptions, FilterPipeline},
    index::{ChunkIndex, IndexInfo},
    layout::ChunkLayout,
};

/// The parts of a dataset that chunk operations work on.
pub(crate) struct ChunkContext<'a> {
    pub(crate) file: &'a FileHandle,
    pub(crate) layout: &'a ChunkLayout,
    pub(crate) pipeline: &'a FilterPipeline,
    pub(crate) fill: &'a FillValue,
    pub(crate) index: &'a mut ChunkIndex,
    pub(crate) options: FilterOptions,
}

impl<'a> ChunkContext<'a> {
    pub(crate) fn info(&self) -> IndexInfo<'a> {
        IndexInfo {
            file: self.file,
            layout: self.layout,
            pipeline: self.pipeline,
        }
    }

    /// Returns true if chunk `scaled` passes through the filter pipeline when stored.
    pub(crate) fn is_filtered(&self, scaled: &[u64]) -> bool {
        !self.pipeline.is_empty() && !self.layout.is_unfiltered_edge_chunk(scaled)
    }

    /// Returns true if the file is open for writing by a group of cooperating processes.
    pub(crate) fn is_parallel_write(&self) -> bool {
        let intent = self.file.intent();
        intent.parallel && intent.read_write
    }
}
