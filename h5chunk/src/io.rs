//! The chunked I/O driver.
//!
//! Reads and writes the pieces of a [`ChunkMap`] through the chunk cache, or directly against the file for chunks that bypass it.
//! In selection I/O mode every direct request of a call is gathered into one vectored storage request.

use h5chunk_storage::{FileAddress, FileRegion};

use crate::{
    allocator::file_alloc,
    cache::ChunkCache,
    context::ChunkContext,
    fill::FillBuffer,
    filter::FilterMask,
    index::{ChunkIndexTraits, StoredChunk},
    mapper::ChunkMap,
    ChunkError,
};

fn to_usize(value: u64) -> Result<usize, ChunkError> {
    usize::try_from(value)
        .map_err(|_| ChunkError::Unsupported(format!("{value} exceeds the address space")))
}

/// Copy elements from `src` to `dst`, pairing the elements of `src_runs` and `dst_runs` in order.
fn copy_runs(
    dst: &mut [u8],
    dst_runs: &[(u64, u64)],
    src: &[u8],
    src_runs: &[(u64, u64)],
    element_size: usize,
) -> Result<(), ChunkError> {
    let mut dst_runs = dst_runs.iter().copied();
    let mut src_runs = src_runs.iter().copied();
    let (mut dst_run, mut src_run) = (dst_runs.next(), src_runs.next());
    while let (Some((dst_offset, dst_len)), Some((src_offset, src_len))) = (dst_run, src_run) {
        let n = std::cmp::min(dst_len, src_len);
        let dst_start = to_usize(dst_offset)? * element_size;
        let src_start = to_usize(src_offset)? * element_size;
        let len = to_usize(n)? * element_size;
        let (Some(dst), Some(src)) = (
            dst.get_mut(dst_start..dst_start + len),
            src.get(src_start..src_start + len),
        ) else {
            return Err(ChunkError::InvalidBufferSize {
                got: std::cmp::min(dst.len(), src.len()),
                expected: std::cmp::max(dst_start, src_start) + len,
            });
        };
        dst.copy_from_slice(src);
        dst_run = if dst_len > n {
            Some((dst_offset + n, dst_len - n))
        } else {
            dst_runs.next()
        };
        src_run = if src_len > n {
            Some((src_offset + n, src_len - n))
        } else {
            src_runs.next()
        };
    }
    Ok(())
}

/// Returns true if every direct request of a call can be gathered into one vectored request.
///
/// This holds when no chunk passes through the filter pipeline or fits the chunk cache.
pub(crate) fn use_selection_io(ctx: &ChunkContext<'_>, cache: &ChunkCache) -> bool {
    crate::config::global_config().selection_io()
        && ctx.pipeline.is_empty()
        && ctx.layout.size_usize() > cache.config().nbytes()
}

/// The file regions of the runs of a chunk stored at `offset`.
fn run_regions(offset: FileAddress, runs: &[(u64, u64)], element_size: u64) -> Vec<FileRegion> {
    runs.iter()
        .map(|&(start, len)| FileRegion::new(offset + start * element_size, len * element_size))
        .collect()
}

/// Read the pieces of `map` into `buf`, which holds the memory extent.
pub(crate) fn read(
    ctx: &mut ChunkContext<'_>,
    cache: &mut ChunkCache,
    map: &ChunkMap<'_>,
    buf: &mut [u8],
) -> Result<(), ChunkError> {
    let element_size = ctx.layout.element_size();
    let es = to_usize(element_size)?;
    let skip_missing = ctx.fill.skip_missing_chunks();
    let selection_io = use_selection_io(ctx, cache);
    let fill = FillBuffer::new(ctx.fill, es);

    let mut regions: Vec<FileRegion> = Vec::new();
    let mut mem_runs: Vec<(u64, u64)> = Vec::new();
    for piece in map.pieces() {
        let lookup = cache.lookup(ctx, piece.scaled())?;
        if !lookup.is_defined() && lookup.hint.is_none() && skip_missing {
            continue;
        }
        let chunk_runs = piece.file_selection().runs();
        let piece_mem_runs = piece.mem_selection().runs();

        if cache.cacheable(ctx, &lookup, false) {
            let locked = cache.lock(ctx, &lookup, false, false)?;
            let copied = copy_runs(buf, &piece_mem_runs, cache.chunk(&locked)?, &chunk_runs, es);
            cache.unlock(ctx, locked, false, piece.num_elements() * element_size)?;
            copied?;
        } else if let Some(stored) = lookup.stored {
            regions.extend(run_regions(stored.offset, &chunk_runs, element_size));
            mem_runs.extend(piece_mem_runs);
            if !selection_io {
                read_direct(ctx, buf, &mut regions, &mut mem_runs, es)?;
            }
        } else {
            fill.fill_elements(buf, &piece_mem_runs);
        }
    }
    read_direct(ctx, buf, &mut regions, &mut mem_runs, es)
}

fn read_direct(
    ctx: &ChunkContext<'_>,
    buf: &mut [u8],
    regions: &mut Vec<FileRegion>,
    mem_runs: &mut Vec<(u64, u64)>,
    element_size: usize,
) -> Result<(), ChunkError> {
    if regions.is_empty() {
        return Ok(());
    }
    log::trace!("direct read of {} regions", regions.len());
    let bytes = ctx.file.read_vector(regions)?;
    let data: Vec<u8> = bytes.iter().flat_map(|bytes| bytes.iter().copied()).collect();
    let num_elements = (data.len() / element_size) as u64;
    copy_runs(buf, mem_runs, &data, &[(0, num_elements)], element_size)?;
    regions.clear();
    mem_runs.clear();
    Ok(())
}

/// Write the pieces of `map` from `buf`, which holds the memory extent.
pub(crate) fn write(
    ctx: &mut ChunkContext<'_>,
    cache: &mut ChunkCache,
    map: &ChunkMap<'_>,
    buf: &[u8],
) -> Result<(), ChunkError> {
    let element_size = ctx.layout.element_size();
    let es = to_usize(element_size)?;
    let selection_io = use_selection_io(ctx, cache);
    let chunk_elements = ctx.layout.chunk_elements();

    let mut writes: Vec<(FileAddress, Vec<u8>)> = Vec::new();
    for piece in map.pieces() {
        let lookup = cache.lookup(ctx, piece.scaled())?;
        let chunk_runs = piece.file_selection().runs();
        let mem_runs = piece.mem_selection().runs();

        if cache.cacheable(ctx, &lookup, true) {
            let relax = piece.num_elements() == chunk_elements;
            let mut locked = cache.lock(ctx, &lookup, relax, false)?;
            let copied = copy_runs(cache.chunk_mut(&mut locked)?, &chunk_runs, buf, &mem_runs, es);
            cache.unlock(ctx, locked, true, piece.num_elements() * element_size)?;
            copied?;
            continue;
        }

        let stored = match lookup.stored {
            Some(stored) => stored,
            None => {
                let length = ctx.layout.size();
                let (offset, need_insert) = file_alloc(ctx, None, length, piece.scaled())?;
                let stored = StoredChunk {
                    offset,
                    length,
                    filter_mask: FilterMask::NONE,
                };
                if need_insert {
                    let info = ctx.info();
                    ctx.index.insert(&info, piece.scaled(), stored)?;
                }
                cache.update_last(ctx, piece.scaled(), Some(stored));
                stored
            }
        };

        let mut data = vec![0; to_usize(piece.num_elements())? * es];
        copy_runs(&mut data, &[(0, piece.num_elements())], buf, &mem_runs, es)?;
        let mut data = data.as_slice();
        for region in run_regions(stored.offset, &chunk_runs, element_size) {
            let (head, tail) = data.split_at(std::cmp::min(to_usize(region.length)?, data.len()));
            writes.push((region.offset, head.to_vec()));
            data = tail;
        }
        if !selection_io {
            write_direct(ctx, &mut writes)?;
        }
    }
    write_direct(ctx, &mut writes)
}

fn write_direct(
    ctx: &ChunkContext<'_>,
    writes: &mut Vec<(FileAddress, Vec<u8>)>,
) -> Result<(), ChunkError> {
    if writes.is_empty() {
        return Ok(());
    }
    log::trace!("direct write of {} regions", writes.len());
    let requests: Vec<(FileAddress, &[u8])> = writes
        .iter()
        .map(|(offset, bytes)| (*offset, bytes.as_slice()))
        .collect();
    ctx.file.write_vector(&requests)?;
    writes.clear();
    Ok(())
}
