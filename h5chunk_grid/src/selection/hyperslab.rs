use std::ops::Range;

use itertools::Itertools;

use crate::{down_strides, linearise, ArrayIndices, ArraySubset, SelectionError};

/// A hyperslab selection in span form.
///
/// Each dimension holds a sorted list of disjoint, non-adjacent index ranges, and the selection is their Cartesian product.
/// Regular hyperslabs (start, stride, count, block), their unions along a single dimension, and their intersections with rectangular regions are all representable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Hyperslab {
    spans: Vec<Vec<Range<u64>>>,
}

fn normalise_spans(mut spans: Vec<Range<u64>>) -> Vec<Range<u64>> {
    spans.retain(|span| span.end > span.start);
    spans.sort_by_key(|span| span.start);
    spans
        .into_iter()
        .coalesce(|a, b| {
            if b.start <= a.end {
                Ok(a.start..std::cmp::max(a.end, b.end))
            } else {
                Err((a, b))
            }
        })
        .collect()
}

impl Hyperslab {
    /// Create a hyperslab from per-dimension spans.
    ///
    /// Spans within a dimension are sorted and merged where they overlap or abut.
    #[must_use]
    pub fn new(spans: Vec<Vec<Range<u64>>>) -> Self {
        Self {
            spans: spans.into_iter().map(normalise_spans).collect(),
        }
    }

    /// Create a regular hyperslab.
    ///
    /// Dimension `i` selects `count[i]` blocks of `block[i]` elements, the first starting at `start[i]` and each subsequent block `stride[i]` elements after the previous.
    ///
    /// # Errors
    /// Returns [`SelectionError`] if the parameters differ in length or a stride is zero.
    pub fn regular(
        start: &[u64],
        stride: &[u64],
        count: &[u64],
        block: &[u64],
    ) -> Result<Self, SelectionError> {
        let dimensionality = start.len();
        for len in [stride.len(), count.len(), block.len()] {
            if len != dimensionality {
                return Err(SelectionError::IncompatibleDimensionality {
                    got: len,
                    expected: dimensionality,
                });
            }
        }
        if stride.contains(&0) {
            return Err(SelectionError::InvalidHyperslab(
                "a hyperslab stride must be non-zero".to_string(),
            ));
        }
        let spans = itertools::izip!(start, stride, count, block)
            .map(|(&start, &stride, &count, &block)| {
                (0..count)
                    .map(|i| {
                        let offset = start + i * stride;
                        offset..offset + block
                    })
                    .collect()
            })
            .collect();
        Ok(Self::new(spans))
    }

    /// Create a hyperslab selecting every element of `subset`.
    #[must_use]
    pub fn from_subset(subset: &ArraySubset) -> Self {
        Self::new(subset.to_ranges().into_iter().map(|r| vec![r]).collect())
    }

    /// Return the dimensionality of the hyperslab.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.spans.len()
    }

    /// Return the per-dimension spans.
    #[must_use]
    pub fn spans(&self) -> &[Vec<Range<u64>>] {
        &self.spans
    }

    /// Return the number of selected elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.spans
            .iter()
            .map(|spans| spans.iter().map(|span| span.end - span.start).sum::<u64>())
            .product()
    }

    /// Returns true if no elements are selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.iter().any(Vec::is_empty)
    }

    /// Return the bounding box of the selection, or [`None`] if it is empty.
    #[must_use]
    pub fn bounds(&self) -> Option<ArraySubset> {
        if self.is_empty() {
            return None;
        }
        Some(ArraySubset::from(self.spans.iter().map(|spans| {
            let first = spans.first().map_or(0, |span| span.start);
            let last = spans.last().map_or(0, |span| span.end);
            first..last
        })))
    }

    /// Return the part of the selection within `subset`, or [`None`] if they do not intersect.
    ///
    /// # Errors
    /// Returns [`SelectionError`] if `subset` differs in dimensionality.
    pub fn intersect(&self, subset: &ArraySubset) -> Result<Option<Self>, SelectionError> {
        if subset.dimensionality() != self.dimensionality() {
            return Err(SelectionError::IncompatibleDimensionality {
                got: subset.dimensionality(),
                expected: self.dimensionality(),
            });
        }
        let mut spans = Vec::with_capacity(self.spans.len());
        for (dim_spans, range) in std::iter::zip(&self.spans, subset.to_ranges()) {
            let clipped: Vec<Range<u64>> = dim_spans
                .iter()
                .filter_map(|span| {
                    let start = std::cmp::max(span.start, range.start);
                    let end = std::cmp::min(span.end, range.end);
                    (start < end).then_some(start..end)
                })
                .collect();
            if clipped.is_empty() {
                return Ok(None);
            }
            spans.push(clipped);
        }
        Ok(Some(Self { spans }))
    }

    /// Translate the selection by a signed per-dimension `delta`.
    ///
    /// # Errors
    /// Returns [`SelectionError`] if `delta` differs in dimensionality or any index would become negative.
    pub fn translate(&self, delta: &[i64]) -> Result<Self, SelectionError> {
        if delta.len() != self.dimensionality() {
            return Err(SelectionError::IncompatibleDimensionality {
                got: delta.len(),
                expected: self.dimensionality(),
            });
        }
        let shift = |value: u64, delta: i64| {
            value
                .checked_add_signed(delta)
                .ok_or(SelectionError::NegativeIndex)
        };
        let spans = std::iter::zip(&self.spans, delta)
            .map(|(spans, &delta)| {
                spans
                    .iter()
                    .map(|span| Ok(shift(span.start, delta)?..shift(span.end, delta)?))
                    .collect::<Result<Vec<_>, SelectionError>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { spans })
    }

    /// Return the selection relative to `offset`.
    ///
    /// # Errors
    /// Returns [`SelectionError`] if `offset` differs in dimensionality or exceeds the selection start.
    pub fn relative_to(&self, offset: &[u64]) -> Result<Self, SelectionError> {
        let delta = offset
            .iter()
            .map(|&offset| i64::try_from(offset).map(|offset| -offset))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SelectionError::NegativeIndex)?;
        self.translate(&delta)
    }

    /// Returns an iterator over the selected indices in row-major order.
    pub fn indices(&self) -> impl Iterator<Item = ArrayIndices> + '_ {
        let product: Box<dyn Iterator<Item = ArrayIndices> + '_> = if self.spans.is_empty() {
            Box::new(std::iter::once(ArrayIndices::new()))
        } else if self.is_empty() {
            Box::new(std::iter::empty())
        } else {
            Box::new(
                self.spans
                    .iter()
                    .map(|spans| spans.iter().flat_map(Clone::clone))
                    .multi_cartesian_product(),
            )
        };
        product
    }

    /// Return the contiguous runs of the selection within an array of `shape` as `(linear offset, length)` pairs in row-major order.
    ///
    /// Adjacent runs are merged.
    #[must_use]
    pub fn runs(&self, shape: &[u64]) -> Vec<(u64, u64)> {
        let Some((last_spans, outer_spans)) = self.spans.split_last() else {
            return vec![(0, 1)];
        };
        if self.is_empty() {
            return vec![];
        }
        let down = down_strides(shape);
        let outer_down = &down[..outer_spans.len()];
        let outer: Box<dyn Iterator<Item = ArrayIndices> + '_> = if outer_spans.is_empty() {
            Box::new(std::iter::once(ArrayIndices::new()))
        } else {
            Box::new(
                outer_spans
                    .iter()
                    .map(|spans| spans.iter().flat_map(Clone::clone))
                    .multi_cartesian_product(),
            )
        };
        outer
            .flat_map(|outer_indices| {
                let base = linearise(&outer_indices, outer_down);
                last_spans
                    .iter()
                    .map(move |span| (base + span.start, span.end - span.start))
            })
            .coalesce(|a, b| {
                if a.0 + a.1 == b.0 {
                    Ok((a.0, a.1 + b.1))
                } else {
                    Err((a, b))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyperslab_regular() -> Result<(), SelectionError> {
        let hyperslab = Hyperslab::regular(&[1, 0], &[4, 1], &[3, 2], &[2, 1])?;
        assert_eq!(hyperslab.spans()[0], vec![1..3, 5..7, 9..11]);
        assert_eq!(hyperslab.spans()[1], vec![0..2]);
        assert_eq!(hyperslab.num_elements(), 12);
        assert_eq!(
            hyperslab.bounds(),
            Some(ArraySubset::new_with_ranges(&[1..11, 0..2]))
        );
        assert!(Hyperslab::regular(&[0], &[0], &[1], &[1]).is_err());
        assert!(Hyperslab::regular(&[0], &[1, 1], &[1], &[1]).is_err());
        Ok(())
    }

    #[test]
    fn hyperslab_normalise() {
        let hyperslab = Hyperslab::new(vec![vec![5..8, 0..2, 2..3, 7..9, 4..4]]);
        assert_eq!(hyperslab.spans()[0], vec![0..3, 5..9]);
    }

    #[test]
    fn hyperslab_intersect_translate() -> Result<(), SelectionError> {
        let hyperslab = Hyperslab::regular(&[1, 1], &[3, 3], &[3, 3], &[2, 2])?;
        let chunk = ArraySubset::new_with_ranges(&[4..8, 4..8]);
        let piece = hyperslab.intersect(&chunk)?.unwrap();
        assert_eq!(piece.spans(), &[vec![4..6, 7..8], vec![4..6, 7..8]]);
        let local = piece.relative_to(chunk.start())?;
        assert_eq!(local.spans(), &[vec![0..2, 3..4], vec![0..2, 3..4]]);
        assert!(hyperslab
            .intersect(&ArraySubset::new_with_ranges(&[3..4, 0..10]))?
            .is_none());
        assert!(local.translate(&[-1, 0]).is_err());
        Ok(())
    }

    #[test]
    fn hyperslab_indices_runs() {
        let hyperslab = Hyperslab::new(vec![vec![1..3], vec![0..1, 2..4]]);
        assert_eq!(
            hyperslab.indices().collect::<Vec<_>>(),
            vec![
                vec![1, 0],
                vec![1, 2],
                vec![1, 3],
                vec![2, 0],
                vec![2, 2],
                vec![2, 3]
            ]
        );
        assert_eq!(hyperslab.runs(&[4, 4]), vec![(4, 1), (6, 3), (10, 2)]);
        let full_rows = Hyperslab::new(vec![vec![1..3], vec![0..4]]);
        assert_eq!(full_rows.runs(&[4, 4]), vec![(4, 8)]);
    }
}
