//! Chunk file space allocation.

use h5chunk_grid::log2_floor;
use h5chunk_storage::FileAddress;

use crate::{
    context::ChunkContext,
    index::{ChunkIndexKind, ChunkIndexTraits, StoredChunk},
    ChunkError,
};

/// The number of bytes available to encode the length of a filtered chunk of `chunk_size` decoded bytes.
///
/// One byte more than the decoded size needs, so filters may grow a chunk.
fn allowed_length_bytes(chunk_size: u64) -> u32 {
    std::cmp::min(8, 1 + (log2_floor(chunk_size) + 8) / 8)
}

fn needed_length_bytes(length: u64) -> u32 {
    (log2_floor(length) + 8) / 8
}

/// Find file space for a chunk of `new_length` stored bytes.
///
/// `old` is the current storage of the chunk, if any.
/// A chunk whose length is unchanged keeps its address, otherwise the old space is released and new space allocated.
/// Under single-writer/multiple-reader writing old space is never reused.
///
/// Returns the address of the chunk and whether its record must be inserted into the index.
pub(crate) fn file_alloc(
    ctx: &mut ChunkContext<'_>,
    old: Option<StoredChunk>,
    new_length: u64,
    scaled: &[u64],
) -> Result<(FileAddress, bool), ChunkError> {
    if !ctx.pipeline.is_empty() {
        let allowed = allowed_length_bytes(ctx.layout.size());
        let needed = needed_length_bytes(new_length);
        if needed > allowed {
            return Err(ChunkError::EncodingOverflow {
                length: new_length,
                needed,
                allowed,
            });
        }
    }

    if let Some(old) = old {
        if old.length == new_length {
            return Ok((old.offset, false));
        }
        log::debug!(
            "chunk {scaled:?} resized from {} to {new_length} bytes, releasing {}",
            old.length,
            old.region()
        );
        ctx.file.release(old.region())?;
    }

    if ctx.index.kind() == ChunkIndexKind::None {
        let info = ctx.info();
        let stored = ctx.index.get_addr(&info, scaled)?.ok_or_else(|| {
            ChunkError::LookupError(format!("chunk {scaled:?} has no implicit address"))
        })?;
        if stored.length != new_length {
            return Err(ChunkError::LookupError(format!(
                "chunk {scaled:?} of {new_length} bytes does not fit its implicit address"
            )));
        }
        return Ok((stored.offset, false));
    }

    let region = ctx.info().allocate(new_length)?;
    log::trace!("allocated {region} for chunk {scaled:?}");
    Ok((region.offset, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_length_encoding() {
        assert_eq!(allowed_length_bytes(100), 2);
        assert_eq!(allowed_length_bytes(255), 2);
        assert_eq!(allowed_length_bytes(256), 3);
        assert_eq!(allowed_length_bytes(u64::MAX), 8);
        assert_eq!(needed_length_bytes(255), 1);
        assert_eq!(needed_length_bytes(256), 2);
        assert_eq!(needed_length_bytes(65536), 3);
    }
}
