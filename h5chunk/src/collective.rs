//! Collective write coordination.
//!
//! Processes that open a file with the parallel intent write newly allocated fill-valued chunks collectively.
//! Each member of the group writes a deterministic share of the sorted chunk addresses after a barrier.

use std::sync::{Arc, Barrier};

use h5chunk_storage::{FileAddress, FileHandle};

use crate::ChunkError;

/// A coordinator of the members of a group of cooperating writers.
pub trait DistributedWriteCoordinator: std::fmt::Debug + Send + Sync {
    /// The rank of this member.
    fn rank(&self) -> usize;

    /// The number of members.
    fn size(&self) -> usize;

    /// Block until every member has reached the barrier.
    fn barrier(&self);

    /// Return the share of `addrs` written by this member.
    ///
    /// Each member takes a contiguous block of `addrs.len() / size` addresses in rank order.
    /// The remaining addresses go to the lowest ranks, one each.
    fn partition(&self, addrs: &[FileAddress]) -> Vec<FileAddress> {
        let (rank, size) = (self.rank(), self.size().max(1));
        let blocks = addrs.len() / size;
        let leftover = addrs.len() % size;
        let mut share = addrs
            .get(rank * blocks..(rank + 1) * blocks)
            .map(<[FileAddress]>::to_vec)
            .unwrap_or_default();
        if leftover > rank {
            share.extend(addrs.get(blocks * size + rank));
        }
        share
    }

    /// Write `buf` to this member's share of `addrs` after a barrier.
    ///
    /// # Errors
    /// Returns a [`ChunkError`] if the write fails.
    fn vector_write(
        &self,
        file: &FileHandle,
        addrs: &[FileAddress],
        buf: &[u8],
    ) -> Result<(), ChunkError> {
        let share = self.partition(addrs);
        self.barrier();
        log::debug!(
            "rank {} of {} writing {} of {} chunks",
            self.rank(),
            self.size(),
            share.len(),
            addrs.len()
        );
        let writes: Vec<(FileAddress, &[u8])> = share.iter().map(|&addr| (addr, buf)).collect();
        file.write_vector(&writes)?;
        Ok(())
    }
}

/// The coordinator of a writer that works alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl DistributedWriteCoordinator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}
}

/// A member of a group of threads writing to one shared file.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
}

impl ThreadGroup {
    /// Create the members of a group of `size` threads.
    #[must_use]
    pub fn new_group(size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                barrier: barrier.clone(),
            })
            .collect()
    }
}

impl DistributedWriteCoordinator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}
