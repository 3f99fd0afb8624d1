//! The `shuffle` filter.
//!
//! Reorders chunk bytes so that byte `j` of every element is stored contiguously, which usually improves compression of numeric data.
//! Trailing bytes that do not form a whole element are stored unchanged.

use std::sync::Arc;

use super::{
    Filter, FilterCreateError, FilterError, FilterId, FilterMessage, FilterOptions, FilterPlugin,
    FilterTraits, FILTER_SHUFFLE,
};

inventory::submit! {
    FilterPlugin::new(FILTER_SHUFFLE, create_filter_shuffle)
}

fn create_filter_shuffle(
    message: &FilterMessage,
    element_size: usize,
) -> Result<Filter, FilterCreateError> {
    match message.client_data.as_slice() {
        [] => Ok(Arc::new(ShuffleFilter::new(element_size))),
        [element_size] => Ok(Arc::new(ShuffleFilter::new(*element_size as usize))),
        _ => Err(FilterCreateError::InvalidParameters {
            id: FILTER_SHUFFLE,
            client_data: message.client_data.clone(),
        }),
    }
}

/// A `shuffle` filter implementation.
#[derive(Clone, Debug)]
pub struct ShuffleFilter {
    element_size: usize,
}

impl ShuffleFilter {
    /// Create a new `shuffle` filter for elements of `element_size` bytes.
    #[must_use]
    pub const fn new(element_size: usize) -> Self {
        Self { element_size }
    }
}

impl FilterTraits for ShuffleFilter {
    fn id(&self) -> FilterId {
        FILTER_SHUFFLE
    }

    fn name(&self) -> &'static str {
        "shuffle"
    }

    fn client_data(&self) -> Vec<u32> {
        vec![u32::try_from(self.element_size).unwrap_or(u32::MAX)]
    }

    fn encode(&self, decoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let n = self.element_size;
        if n <= 1 || decoded.len() < 2 * n {
            return Ok(decoded.to_vec());
        }
        let count = decoded.len() / n;
        let mut encoded = vec![0; decoded.len()];
        for (i, element) in decoded.chunks_exact(n).enumerate() {
            for (j, byte) in element.iter().enumerate() {
                encoded[j * count + i] = *byte;
            }
        }
        encoded[count * n..].copy_from_slice(&decoded[count * n..]);
        Ok(encoded)
    }

    fn decode(&self, encoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let n = self.element_size;
        if n <= 1 || encoded.len() < 2 * n {
            return Ok(encoded.to_vec());
        }
        let count = encoded.len() / n;
        let mut decoded = vec![0; encoded.len()];
        for (i, element) in decoded.chunks_exact_mut(n).enumerate() {
            for (j, byte) in element.iter_mut().enumerate() {
                *byte = encoded[j * count + i];
            }
        }
        decoded[count * n..].copy_from_slice(&encoded[count * n..]);
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_shuffle_known_pattern() -> Result<(), FilterError> {
        let filter = ShuffleFilter::new(2);
        let options = FilterOptions::default();
        let encoded = filter.encode(&[1, 2, 3, 4, 5, 6, 7], &options)?;
        assert_eq!(encoded, vec![1, 3, 5, 2, 4, 6, 7]);
        assert_eq!(filter.decode(&encoded, &options)?, vec![1, 2, 3, 4, 5, 6, 7]);
        Ok(())
    }

    #[test]
    fn filter_shuffle_element_size_from_dataset() -> Result<(), FilterCreateError> {
        let message = FilterMessage {
            id: FILTER_SHUFFLE,
            flags: super::super::FilterFlags::OPTIONAL,
            name: None,
            client_data: vec![],
        };
        let filter = create_filter_shuffle(&message, 8)?;
        assert_eq!(filter.client_data(), vec![8]);
        Ok(())
    }
}
