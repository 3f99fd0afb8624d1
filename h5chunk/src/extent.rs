//! Extent changes.
//!
//! Growing a dataset may allocate the newly exposed chunks and refilter former partial edge chunks.
//! Shrinking removes the chunks that fall outside the new extent and fills the out of bounds part of the chunks that straddle it.

use std::collections::BTreeSet;

use h5chunk_grid::{iterators::ChunkOdometer, ArrayIndices};
use h5chunk_storage::FileAddress;

use crate::{
    allocator::file_alloc,
    cache::ChunkCache,
    collective::DistributedWriteCoordinator,
    context::ChunkContext,
    fill::FillBuffer,
    filter::FilterMask,
    index::{ChunkIndexKind, ChunkIndexTraits, StoredChunk},
    layout::LayoutFlags,
    ChunkError,
};

fn element_size(ctx: &ChunkContext<'_>) -> usize {
    usize::try_from(ctx.layout.element_size()).unwrap_or(1)
}

/// Allocate every chunk exposed by growing the dataset from `old_dims`.
///
/// Chunks are filled if the fill value policy requires it, and filtered chunks always are so that they decode.
/// Under the parallel intent unfiltered fill values are written collectively through `coordinator`.
pub(crate) fn chunk_allocate(
    ctx: &mut ChunkContext<'_>,
    cache: &mut ChunkCache,
    old_dims: &[u64],
    coordinator: &dyn DistributedWriteCoordinator,
) -> Result<(), ChunkError> {
    let layout = ctx.layout;
    let dims = layout.dims();
    let chunk_shape = layout.chunk_shape();
    if dims.contains(&0) {
        return Ok(());
    }
    let ndims = dims.len();
    let min_unalloc: Vec<u64> = std::iter::zip(old_dims, chunk_shape)
        .map(|(&old, &chunk)| old.div_ceil(chunk))
        .collect();
    let max_unalloc: Vec<u64> = std::iter::zip(dims, chunk_shape)
        .map(|(&dim, &chunk)| (dim - 1) / chunk)
        .collect();

    let must_fill = ctx.fill.must_write_fill();
    let parallel = ctx.file.intent().parallel;
    let chunk_size = layout.size();
    let raw_fill = FillBuffer::new(ctx.fill, element_size(ctx)).chunk(layout.size_usize());
    let filtered_fill = if ctx.pipeline.is_empty() {
        None
    } else {
        Some(ctx.pipeline.apply(raw_fill.clone(), &ctx.options)?)
    };

    let mut collective: Vec<FileAddress> = Vec::new();
    let mut nallocated = 0_u64;
    for op_dim in 0..ndims {
        if min_unalloc[op_dim] > max_unalloc[op_dim] {
            continue;
        }
        // chunks below min_unalloc in earlier dimensions were visited by their own pass
        let mut min = vec![0; ndims];
        let mut max = max_unalloc.clone();
        min[op_dim] = min_unalloc[op_dim];
        if (0..op_dim).any(|dim| min_unalloc[dim] == 0) {
            continue;
        }
        for dim in 0..op_dim {
            max[dim] = std::cmp::min(max[dim], min_unalloc[dim] - 1);
        }

        for scaled in ChunkOdometer::new(min, max) {
            let info = ctx.info();
            if ctx.index.kind() != ChunkIndexKind::None
                && ctx.index.get_addr(&info, &scaled)?.is_some()
            {
                continue;
            }
            let (data, length, filter_mask) = match &filtered_fill {
                Some((encoded, mask)) if ctx.is_filtered(&scaled) => {
                    (Some(encoded.as_slice()), encoded.len() as u64, *mask)
                }
                _ => (
                    must_fill.then_some(raw_fill.as_slice()),
                    chunk_size,
                    FilterMask::NONE,
                ),
            };
            let (offset, need_insert) = file_alloc(ctx, None, length, &scaled)?;
            if need_insert {
                let info = ctx.info();
                ctx.index.insert(
                    &info,
                    &scaled,
                    StoredChunk {
                        offset,
                        length,
                        filter_mask,
                    },
                )?;
            }
            match data {
                Some(_) if parallel && filter_mask == FilterMask::NONE && length == chunk_size => {
                    collective.push(offset);
                }
                Some(data) => ctx.file.write(offset, data)?,
                None => {}
            }
            nallocated += 1;
        }
    }

    if !collective.is_empty() {
        collective.sort_unstable();
        coordinator.vector_write(ctx.file, &collective, &raw_fill)?;
    }
    cache.reset_last();
    log::debug!("allocated {nallocated} chunks");
    Ok(())
}

/// Refilter the former partial edge chunks that growing the dataset from `old_dims` made complete.
///
/// Only applies to layouts that do not filter partial edge chunks.
pub(crate) fn update_old_edge_chunks(
    ctx: &mut ChunkContext<'_>,
    cache: &mut ChunkCache,
    old_dims: &[u64],
) -> Result<(), ChunkError> {
    let layout = ctx.layout;
    if ctx.pipeline.is_empty()
        || !layout
            .flags()
            .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS)
        || old_dims.contains(&0)
    {
        return Ok(());
    }
    let chunk_shape = layout.chunk_shape();
    let old_max: Vec<u64> = std::iter::zip(old_dims, chunk_shape)
        .map(|(&old, &chunk)| (old - 1) / chunk)
        .collect();

    let mut chunks: BTreeSet<ArrayIndices> = BTreeSet::new();
    for (op_dim, (&old, &chunk)) in std::iter::zip(old_dims, chunk_shape).enumerate() {
        let old_edge = old / chunk;
        if old % chunk == 0 || (old_edge + 1) * chunk > layout.dims()[op_dim] {
            continue;
        }
        let mut min = vec![0; old_dims.len()];
        let mut max = old_max.clone();
        min[op_dim] = old_edge;
        max[op_dim] = old_edge;
        chunks.extend(ChunkOdometer::new(min, max).filter(|scaled| {
            layout.is_partial_edge_chunk_in(scaled, old_dims) && !layout.is_partial_edge_chunk(scaled)
        }));
    }

    for scaled in chunks {
        let lookup = cache.lookup(ctx, &scaled)?;
        if !lookup.is_defined() && lookup.hint.is_none() {
            continue;
        }
        log::trace!("refiltering former edge chunk {scaled:?}");
        let locked = cache.lock(ctx, &lookup, false, true)?;
        cache.unlock(ctx, locked, true, 0)?;
    }
    Ok(())
}

/// Return the `(element offset, length)` runs of a chunk of `chunk_shape` outside its first `in_bounds` elements per dimension.
fn out_of_bounds_runs(chunk_shape: &[u64], in_bounds: &[u64]) -> Vec<(u64, u64)> {
    let Some((&row_len, outer)) = chunk_shape.split_last() else {
        return vec![];
    };
    let row_in_bounds = in_bounds.last().copied().unwrap_or(row_len);
    let rows: u64 = outer.iter().product();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for row in 0..rows {
        let mut rem = row;
        let mut inside = true;
        for (&extent, &bound) in outer.iter().zip(in_bounds).rev() {
            inside &= rem % extent < bound;
            rem /= extent;
        }
        let base = row * row_len;
        let run = if inside {
            (row_in_bounds < row_len).then(|| (base + row_in_bounds, row_len - row_in_bounds))
        } else {
            Some((base, row_len))
        };
        match (runs.last_mut(), run) {
            (Some(last), Some(run)) if last.0 + last.1 == run.0 => last.1 += run.1,
            (_, Some(run)) => runs.push(run),
            (_, None) => {}
        }
    }
    runs
}

/// Remove or trim the chunks outside the extent after shrinking the dataset from `old_dims`.
///
/// Chunks entirely outside the new extent are evicted without being written, removed from the index, and their file space is released.
/// Chunks that straddle the new extent have their out of bounds elements overwritten with the fill value.
pub(crate) fn prune_by_extent(
    ctx: &mut ChunkContext<'_>,
    cache: &mut ChunkCache,
    old_dims: &[u64],
) -> Result<(), ChunkError> {
    let layout = ctx.layout;
    let dims = layout.dims().to_vec();
    let chunk_shape = layout.chunk_shape().to_vec();
    if old_dims.contains(&0) {
        return Ok(());
    }
    let old_max: Vec<u64> = std::iter::zip(old_dims, &chunk_shape)
        .map(|(&old, &chunk)| (old - 1) / chunk)
        .collect();

    let mut chunks: BTreeSet<ArrayIndices> = BTreeSet::new();
    for (op_dim, (&dim, &old)) in std::iter::zip(&dims, old_dims).enumerate() {
        if dim >= old {
            continue;
        }
        let mut min = vec![0; dims.len()];
        min[op_dim] = dim / chunk_shape[op_dim];
        chunks.extend(ChunkOdometer::new(min, old_max.clone()));
    }

    let fill = FillBuffer::new(ctx.fill, element_size(ctx));
    let newly_unfiltered = !ctx.pipeline.is_empty()
        && layout
            .flags()
            .contains(LayoutFlags::DONT_FILTER_PARTIAL_BOUND_CHUNKS);
    let (mut nremoved, mut nfilled) = (0_u64, 0_u64);
    for scaled in chunks {
        let origin = layout.chunk_origin(&scaled);
        let outside = std::iter::zip(&origin, &dims).any(|(&start, &dim)| start >= dim);
        if outside {
            cache.evict_chunk(ctx, &scaled, false)?;
            let info = ctx.info();
            if let Some(stored) = ctx.index.remove(&info, &scaled)? {
                ctx.file.release(stored.region())?;
                log::trace!("removed chunk {scaled:?} at {}", stored.region());
                nremoved += 1;
            }
        } else {
            let mut lookup = cache.lookup(ctx, &scaled)?;
            if !lookup.is_defined() && lookup.hint.is_none() {
                continue;
            }
            lookup.new_unfilt = newly_unfiltered
                && layout.is_partial_edge_chunk(&scaled)
                && !layout.is_partial_edge_chunk_in(&scaled, old_dims);
            let in_bounds: Vec<u64> = itertools::izip!(&origin, &dims, &chunk_shape)
                .map(|(&start, &dim, &chunk)| std::cmp::min(chunk, dim - start))
                .collect();
            let runs = out_of_bounds_runs(&chunk_shape, &in_bounds);
            let mut locked = cache.lock(ctx, &lookup, false, false)?;
            let filled = cache
                .chunk_mut(&mut locked)
                .map(|buf| fill.fill_elements(buf, &runs));
            cache.unlock(ctx, locked, true, 0)?;
            filled?;
            nfilled += 1;
        }
    }
    cache.reset_last();
    log::debug!("pruned {nremoved} chunks and filled {nfilled} straddling chunks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_runs_2d() {
        // 3x4 chunk with 2x3 in bounds
        assert_eq!(out_of_bounds_runs(&[3, 4], &[2, 3]), vec![(3, 1), (7, 5)]);
        assert_eq!(out_of_bounds_runs(&[20], &[10]), vec![(10, 10)]);
        assert!(out_of_bounds_runs(&[4, 4], &[4, 4]).is_empty());
    }
}
