//! Dataspaces and selections.
//!
//! A [`Dataspace`] is the extent of an array (in a file or in memory) together with a [`Selection`] of its elements.
//! Selected elements are iterated in a well defined order: row-major for all and hyperslab selections, insertion order for point selections.
//! Two selections with the same number of elements are paired element-by-element in that order during I/O.

mod hyperslab;

pub use hyperslab::Hyperslab;

use derive_more::From;
use itertools::Itertools;
use thiserror::Error;

use crate::{ravel_indices, ArrayIndices, ArrayShape, ArraySubset};

/// A selection error.
#[derive(Clone, Debug, Error)]
#[allow(missing_docs)]
pub enum SelectionError {
    /// Incompatible dimensionality.
    #[error("incompatible dimensionality {got}, expected {expected}")]
    IncompatibleDimensionality { got: usize, expected: usize },
    /// A selection extends beyond the dataspace extent.
    #[error("selection {selection} is out of bounds of extent {shape:?}")]
    OutOfBounds {
        selection: String,
        shape: ArrayShape,
    },
    /// Invalid hyperslab parameters.
    #[error("invalid hyperslab: {0}")]
    InvalidHyperslab(String),
    /// A translation produced a negative index.
    #[error("selection translated to a negative index")]
    NegativeIndex,
}

/// A selection of elements of a dataspace.
#[derive(Clone, Debug, PartialEq, Eq, From)]
pub enum Selection {
    /// No elements.
    None,
    /// Every element.
    All,
    /// A hyperslab of elements.
    #[from]
    Hyperslab(Hyperslab),
    /// A list of points, iterated in insertion order.
    Points(Vec<ArrayIndices>),
}

/// An array extent with a selection of its elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataspace {
    shape: ArrayShape,
    selection: Selection,
}

impl Dataspace {
    /// Create a new dataspace with every element selected.
    #[must_use]
    pub fn new(shape: ArrayShape) -> Self {
        Self {
            shape,
            selection: Selection::All,
        }
    }

    /// Create a new dataspace with a selection.
    ///
    /// # Errors
    /// Returns a [`SelectionError`] if the selection does not match the dimensionality of `shape` or extends beyond it.
    pub fn new_with_selection(
        shape: ArrayShape,
        selection: Selection,
    ) -> Result<Self, SelectionError> {
        match &selection {
            Selection::None | Selection::All => {}
            Selection::Hyperslab(hyperslab) => {
                if hyperslab.dimensionality() != shape.len() {
                    return Err(SelectionError::IncompatibleDimensionality {
                        got: hyperslab.dimensionality(),
                        expected: shape.len(),
                    });
                }
                if let Some(bounds) = hyperslab.bounds() {
                    if !bounds.inbounds_shape(&shape) {
                        return Err(SelectionError::OutOfBounds {
                            selection: bounds.to_string(),
                            shape,
                        });
                    }
                }
            }
            Selection::Points(points) => {
                for point in points {
                    if point.len() != shape.len() {
                        return Err(SelectionError::IncompatibleDimensionality {
                            got: point.len(),
                            expected: shape.len(),
                        });
                    }
                    if std::iter::zip(point, &shape).any(|(i, s)| i >= s) {
                        return Err(SelectionError::OutOfBounds {
                            selection: format!("{point:?}"),
                            shape,
                        });
                    }
                }
            }
        }
        Ok(Self { shape, selection })
    }

    /// Create a new dataspace selecting a rectangular `subset`.
    ///
    /// # Errors
    /// Returns a [`SelectionError`] if `subset` is incompatible with `shape`.
    pub fn new_with_subset(shape: ArrayShape, subset: &ArraySubset) -> Result<Self, SelectionError> {
        Self::new_with_selection(shape, Hyperslab::from_subset(subset).into())
    }

    /// Return the extent of the dataspace.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Return the selection.
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Return the dimensionality of the dataspace.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.shape.len()
    }

    /// Return the number of elements in the extent.
    #[must_use]
    pub fn extent_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Return the number of selected elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        match &self.selection {
            Selection::None => 0,
            Selection::All => self.extent_elements(),
            Selection::Hyperslab(hyperslab) => hyperslab.num_elements(),
            Selection::Points(points) => points.len() as u64,
        }
    }

    /// Return the bounding box of the selection, or [`None`] if nothing is selected.
    #[must_use]
    pub fn bounds(&self) -> Option<ArraySubset> {
        match &self.selection {
            Selection::None => None,
            Selection::All => {
                (self.extent_elements() > 0).then(|| ArraySubset::new_with_shape(self.shape.clone()))
            }
            Selection::Hyperslab(hyperslab) => hyperslab.bounds(),
            Selection::Points(points) => {
                let first = points.first()?;
                let (start, end) = points.iter().skip(1).fold(
                    (first.clone(), first.clone()),
                    |(mut start, mut end), point| {
                        for (dim, &i) in point.iter().enumerate() {
                            start[dim] = std::cmp::min(start[dim], i);
                            end[dim] = std::cmp::max(end[dim], i);
                        }
                        (start, end)
                    },
                );
                ArraySubset::new_with_start_end_inc(start, end).ok()
            }
        }
    }

    /// Return the selection as a hyperslab if it is an all or hyperslab selection.
    #[must_use]
    pub fn to_hyperslab(&self) -> Option<Hyperslab> {
        match &self.selection {
            Selection::All => Some(Hyperslab::from_subset(&ArraySubset::new_with_shape(
                self.shape.clone(),
            ))),
            Selection::Hyperslab(hyperslab) => Some(hyperslab.clone()),
            Selection::None | Selection::Points(_) => None,
        }
    }

    /// Returns an iterator over the selected indices in selection order.
    #[must_use]
    pub fn indices(&self) -> Box<dyn Iterator<Item = ArrayIndices> + '_> {
        match &self.selection {
            Selection::None => Box::new(std::iter::empty()),
            Selection::All => Box::new(
                ArraySubset::new_with_shape(self.shape.clone())
                    .indices()
                    .into_iter()
                    .map(|indices| indices.to_vec()),
            ),
            Selection::Hyperslab(hyperslab) => Box::new(hyperslab.indices()),
            Selection::Points(points) => Box::new(points.iter().cloned()),
        }
    }

    /// Return the selection as `(linear offset, length)` runs within the extent, in selection order.
    ///
    /// Adjacent runs are merged.
    #[must_use]
    pub fn runs(&self) -> Vec<(u64, u64)> {
        match &self.selection {
            Selection::None => vec![],
            Selection::All => {
                let num_elements = self.extent_elements();
                if num_elements == 0 {
                    vec![]
                } else {
                    vec![(0, num_elements)]
                }
            }
            Selection::Hyperslab(hyperslab) => hyperslab.runs(&self.shape),
            Selection::Points(points) => points
                .iter()
                .filter_map(|point| ravel_indices(point, &self.shape))
                .map(|index| (index, 1))
                .coalesce(|a, b| {
                    if a.0 + a.1 == b.0 {
                        Ok((a.0, a.1 + b.1))
                    } else {
                        Err((a, b))
                    }
                })
                .collect(),
        }
    }

    /// Return the per-dimension translation that maps this selection exactly onto the selection of `other`.
    ///
    /// Returns [`None`] if the dimensionalities differ or `other` is not a translate of this selection.
    #[must_use]
    pub fn translation_to(&self, other: &Dataspace) -> Option<Vec<i64>> {
        if self.dimensionality() != other.dimensionality() {
            return None;
        }
        let (a, b) = (self.to_hyperslab()?, other.to_hyperslab()?);
        std::iter::zip(a.spans(), b.spans())
            .map(|(a, b)| {
                if a.len() != b.len() {
                    return None;
                }
                let delta = match (a.first(), b.first()) {
                    (Some(a), Some(b)) => {
                        i64::try_from(b.start).ok()? - i64::try_from(a.start).ok()?
                    }
                    _ => 0,
                };
                std::iter::zip(a, b)
                    .all(|(a, b)| {
                        a.start.checked_add_signed(delta) == Some(b.start)
                            && a.end.checked_add_signed(delta) == Some(b.end)
                    })
                    .then_some(delta)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataspace_all() {
        let space = Dataspace::new(vec![3, 4]);
        assert_eq!(space.num_elements(), 12);
        assert_eq!(space.bounds(), Some(ArraySubset::new_with_shape(vec![3, 4])));
        assert_eq!(space.runs(), vec![(0, 12)]);
        assert_eq!(space.indices().nth(5), Some(vec![1, 1]));
    }

    #[test]
    fn dataspace_points() -> Result<(), SelectionError> {
        let space = Dataspace::new_with_selection(
            vec![4, 4],
            Selection::Points(vec![vec![3, 1], vec![0, 2], vec![0, 3]]),
        )?;
        assert_eq!(space.num_elements(), 3);
        assert_eq!(space.bounds(), Some(ArraySubset::new_with_ranges(&[0..4, 1..4])));
        assert_eq!(space.runs(), vec![(13, 1), (2, 2)]);
        assert!(Dataspace::new_with_selection(vec![4, 4], Selection::Points(vec![vec![4, 0]]))
            .is_err());
        assert!(
            Dataspace::new_with_selection(vec![4, 4], Selection::Points(vec![vec![0]])).is_err()
        );
        Ok(())
    }

    #[test]
    fn dataspace_hyperslab() -> Result<(), SelectionError> {
        let hyperslab = Hyperslab::regular(&[0, 1], &[2, 1], &[2, 1], &[1, 3])?;
        let space = Dataspace::new_with_selection(vec![4, 4], hyperslab.into())?;
        assert_eq!(space.num_elements(), 6);
        assert_eq!(space.runs(), vec![(1, 3), (9, 3)]);
        let too_big = Hyperslab::regular(&[0, 2], &[1, 1], &[1, 1], &[1, 3])?;
        assert!(Dataspace::new_with_selection(vec![4, 4], too_big.into()).is_err());
        Ok(())
    }

    #[test]
    fn dataspace_translation_to() -> Result<(), SelectionError> {
        let file = Dataspace::new_with_subset(vec![10, 10], &ArraySubset::new_with_ranges(&[2..4, 3..8]))?;
        let memory = Dataspace::new_with_subset(vec![4, 6], &ArraySubset::new_with_ranges(&[1..3, 0..5]))?;
        assert_eq!(file.translation_to(&memory), Some(vec![-1, -3]));
        assert_eq!(memory.translation_to(&file), Some(vec![1, 3]));
        assert_eq!(file.translation_to(&Dataspace::new(vec![10])), None);
        let column = Dataspace::new_with_subset(vec![10, 10], &ArraySubset::new_with_ranges(&[0..5, 0..1]))?;
        let row = Dataspace::new_with_subset(vec![10, 10], &ArraySubset::new_with_ranges(&[0..1, 0..5]))?;
        assert_eq!(column.translation_to(&row), None);
        Ok(())
    }
}
