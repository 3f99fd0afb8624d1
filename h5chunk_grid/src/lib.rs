//! The chunk grid, array subset and dataspace selection API for the `h5chunk` crate.
//!
//! - [`ArraySubset`] is a rectangular region of an array or chunk.
//! - [`ChunkOdometer`](iterators::ChunkOdometer) walks chunk coordinates bounded by per-dimension minimum and maximum indices in row-major order.
//! - [`Dataspace`] pairs an array shape with a [`Selection`]: nothing, everything, a hyperslab, or a list of points.
//! - [`down_strides`] and [`linearise`] convert chunk coordinates to linear chunk indices.
//!
//! ## Licence
//! `h5chunk_grid` is licensed under either of
//!  - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//!  - the MIT license <http://opensource.org/licenses/MIT>, at your option.

mod array_subset;
pub use array_subset::{ArraySubset, ArraySubsetError};

pub mod iterators;

mod selection;
pub use selection::{Dataspace, Hyperslab, Selection, SelectionError};

/// An ND index to an element in an array or chunk.
pub type ArrayIndices = Vec<u64>;

/// An ND index to an element in an array or chunk.
/// Uses [`TinyVec`](tinyvec::TinyVec) for stack allocation up to 4 dimensions.
pub type ArrayIndicesTinyVec = tinyvec::TinyVec<[u64; 4]>;

/// The shape of an array.
pub type ArrayShape = Vec<u64>;

/// An incompatible dimensionality error.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("incompatible dimensionality {0}, expected {1}")]
pub struct IncompatibleDimensionalityError(usize, usize);

impl IncompatibleDimensionalityError {
    /// Create a new incompatible dimensionality error.
    #[must_use]
    pub const fn new(got: usize, expected: usize) -> Self {
        Self(got, expected)
    }
}

/// Return the row-major "down" strides of `shape`.
///
/// The last stride is 1 and each preceding stride is the product of all following extents.
#[must_use]
pub fn down_strides(shape: &[u64]) -> Vec<u64> {
    let mut down = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        down[i] = down[i + 1] * shape[i + 1];
    }
    down
}

/// Linearise `indices` with precomputed `down` strides.
#[must_use]
pub fn linearise(indices: &[u64], down: &[u64]) -> u64 {
    std::iter::zip(indices, down).map(|(i, d)| i * d).sum()
}

/// Ravel ND indices to a linearised index.
///
/// Returns [`None`] if any `indices` are out-of-bounds of `shape`.
#[must_use]
pub fn ravel_indices(indices: &[u64], shape: &[u64]) -> Option<u64> {
    let mut index: u64 = 0;
    let mut count = 1;
    for (i, s) in std::iter::zip(indices, shape).rev() {
        if i >= s {
            return None;
        }
        index += i * count;
        count *= s;
    }
    Some(index)
}

/// Unravel a linearised index to ND indices.
///
/// Returns [`None`] if `index` is out-of-bounds of `shape`.
#[must_use]
pub fn unravel_index(mut index: u64, shape: &[u64]) -> Option<ArrayIndicesTinyVec> {
    let total_size: u64 = shape
        .iter()
        .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))?;
    if index >= total_size {
        return None;
    }
    let mut indices = ArrayIndicesTinyVec::with_capacity(shape.len());
    indices.resize(shape.len(), 0);
    for (i, &extent) in shape.iter().enumerate().rev() {
        indices[i] = index % extent;
        index /= extent;
    }
    Some(indices)
}

/// Return `value` rounded up to the next power of two.
///
/// Zero and one round up to one.
#[must_use]
pub const fn power2up(value: u64) -> u64 {
    if value <= 1 {
        1
    } else {
        value.next_power_of_two()
    }
}

/// Return the base 2 logarithm of `value`, rounded down.
///
/// The logarithm of zero is zero.
#[must_use]
pub const fn log2_floor(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        63 - value.leading_zeros()
    }
}
