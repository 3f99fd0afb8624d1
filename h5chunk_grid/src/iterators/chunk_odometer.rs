use std::iter::FusedIterator;

use crate::ArrayIndices;

/// A restartable iterator over chunk coordinates bounded by per-dimension inclusive `[min, max]` indices.
///
/// Coordinates are visited exactly once in row-major order, incrementing the last dimension fastest and carrying into preceding dimensions.
/// The iterator is empty if any `min` exceeds its `max`.
#[derive(Clone, Debug)]
pub struct ChunkOdometer {
    min: ArrayIndices,
    max: ArrayIndices,
    next: Option<ArrayIndices>,
}

impl ChunkOdometer {
    /// Create a new chunk odometer.
    ///
    /// # Panics
    /// Panics if `min` and `max` differ in length.
    #[must_use]
    pub fn new(min: ArrayIndices, max: ArrayIndices) -> Self {
        assert_eq!(min.len(), max.len());
        let mut odometer = Self {
            min,
            max,
            next: None,
        };
        odometer.reset();
        odometer
    }

    /// Restart the odometer from its minimum coordinate.
    pub fn reset(&mut self) {
        self.next = if std::iter::zip(&self.min, &self.max).any(|(min, max)| min > max) {
            None
        } else {
            Some(self.min.clone())
        };
    }

    /// Return the number of coordinates in the full sequence.
    #[must_use]
    pub fn len(&self) -> u64 {
        std::iter::zip(&self.min, &self.max)
            .map(|(&min, &max)| if max >= min { max - min + 1 } else { 0 })
            .product()
    }

    /// Returns true if the sequence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for ChunkOdometer {
    type Item = ArrayIndices;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut next = current.clone();
        let mut carry = true;
        for dim in (0..next.len()).rev() {
            if next[dim] < self.max[dim] {
                next[dim] += 1;
                carry = false;
                break;
            }
            next[dim] = self.min[dim];
        }
        if !carry {
            self.next = Some(next);
        }
        Some(current)
    }
}

impl FusedIterator for ChunkOdometer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_odometer_row_major() {
        let odometer = ChunkOdometer::new(vec![1, 0], vec![2, 2]);
        assert_eq!(odometer.len(), 6);
        assert_eq!(
            odometer.collect::<Vec<_>>(),
            vec![
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
                vec![2, 0],
                vec![2, 1],
                vec![2, 2]
            ]
        );
    }

    #[test]
    fn chunk_odometer_restart() {
        let mut odometer = ChunkOdometer::new(vec![0, 3, 1], vec![1, 3, 2]);
        let first: Vec<_> = odometer.by_ref().collect();
        assert_eq!(first.len(), 4);
        assert!(odometer.next().is_none());
        odometer.reset();
        assert_eq!(odometer.collect::<Vec<_>>(), first);
    }

    #[test]
    fn chunk_odometer_empty() {
        let mut odometer = ChunkOdometer::new(vec![2, 0], vec![1, 5]);
        assert!(odometer.is_empty());
        assert!(odometer.next().is_none());
        let mut scalar = ChunkOdometer::new(vec![], vec![]);
        assert_eq!(scalar.next(), Some(vec![]));
        assert!(scalar.next().is_none());
    }
}
