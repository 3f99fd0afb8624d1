use std::iter::FusedIterator;

use crate::{ArrayIndicesTinyVec, ArraySubset};

/// An iterator over the indices in an array subset.
///
/// Iterates over the last dimension fastest (i.e. C-contiguous order).
/// For example, consider a 4x3 array with element indices
/// ```text
/// (0, 0)  (0, 1)  (0, 2)
/// (1, 0)  (1, 1)  (1, 2)
/// (2, 0)  (2, 1)  (2, 2)
/// (3, 0)  (3, 1)  (3, 2)
/// ```
/// An iterator with an array subset corresponding to the lower right 2x2 region will produce `[(2, 1), (2, 2), (3, 1), (3, 2)]`.
#[derive(Clone, Debug)]
pub struct Indices {
    subset: ArraySubset,
}

impl Indices {
    /// Create a new indices struct.
    #[must_use]
    pub fn new(subset: ArraySubset) -> Self {
        Self { subset }
    }

    /// Return the number of indices.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.subset.num_elements()
    }

    /// Returns true if the number of indices is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IntoIterator for Indices {
    type Item = ArrayIndicesTinyVec;
    type IntoIter = IndicesIntoIterator;

    fn into_iter(self) -> Self::IntoIter {
        let next = if self.subset.is_empty() {
            None
        } else {
            Some(self.subset.start().iter().copied().collect())
        };
        let remaining = self.subset.num_elements();
        IndicesIntoIterator {
            subset: self.subset,
            next,
            remaining,
        }
    }
}

/// Serial indices iterator.
///
/// See [`Indices`].
#[derive(Clone, Debug)]
pub struct IndicesIntoIterator {
    subset: ArraySubset,
    next: Option<ArrayIndicesTinyVec>,
    remaining: u64,
}

impl Iterator for IndicesIntoIterator {
    type Item = ArrayIndicesTinyVec;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.remaining -= 1;
        if self.remaining > 0 {
            let mut next = current.clone();
            let start = self.subset.start();
            let shape = self.subset.shape();
            for dim in (0..next.len()).rev() {
                next[dim] += 1;
                if next[dim] < start[dim] + shape[dim] {
                    break;
                }
                next[dim] = start[dim];
            }
            self.next = Some(next);
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for IndicesIntoIterator {}

impl FusedIterator for IndicesIntoIterator {}
