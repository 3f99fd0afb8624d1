//! The `deflate` filter.
//!
//! Compresses chunks into a zlib stream.
//! The filter message carries the compression level as its only parameter.

use std::io::{Cursor, Read};
use std::sync::Arc;

use flate2::Compression;

use super::{
    Filter, FilterCreateError, FilterError, FilterId, FilterMessage, FilterOptions, FilterPlugin,
    FilterTraits, FILTER_DEFLATE,
};

inventory::submit! {
    FilterPlugin::new(FILTER_DEFLATE, create_filter_deflate)
}

fn create_filter_deflate(
    message: &FilterMessage,
    _element_size: usize,
) -> Result<Filter, FilterCreateError> {
    match message.client_data.as_slice() {
        [] => Ok(Arc::new(DeflateFilter::new(6))),
        [level] if *level <= 9 => Ok(Arc::new(DeflateFilter::new(*level))),
        _ => Err(FilterCreateError::InvalidParameters {
            id: FILTER_DEFLATE,
            client_data: message.client_data.clone(),
        }),
    }
}

/// A `deflate` filter implementation.
#[derive(Clone, Debug)]
pub struct DeflateFilter {
    compression: Compression,
}

impl DeflateFilter {
    /// Create a new `deflate` filter with compression `level` in `[0, 9]`.
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            compression: Compression::new(level.min(9)),
        }
    }
}

impl FilterTraits for DeflateFilter {
    fn id(&self) -> FilterId {
        FILTER_DEFLATE
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn client_data(&self) -> Vec<u32> {
        vec![self.compression.level()]
    }

    fn encode(&self, decoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let mut encoder = flate2::read::ZlibEncoder::new(Cursor::new(decoded), self.compression);
        let mut out: Vec<u8> = Vec::new();
        encoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn decode(&self, encoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let mut decoder = flate2::read::ZlibDecoder::new(Cursor::new(encoded));
        let mut out: Vec<u8> = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_deflate_round_trip() -> Result<(), FilterError> {
        let filter = DeflateFilter::new(9);
        let options = FilterOptions::default();
        let decoded: Vec<u8> = (0..1024u32).map(|i| (i % 7) as u8).collect();
        let encoded = filter.encode(&decoded, &options)?;
        assert!(encoded.len() < decoded.len());
        assert_eq!(filter.decode(&encoded, &options)?, decoded);
        assert!(filter.decode(&[1, 2, 3], &options).is_err());
        Ok(())
    }

    #[test]
    fn filter_deflate_create() {
        let message = |client_data| FilterMessage {
            id: FILTER_DEFLATE,
            flags: super::super::FilterFlags::OPTIONAL,
            name: None,
            client_data,
        };
        assert!(create_filter_deflate(&message(vec![4]), 1).is_ok());
        assert!(create_filter_deflate(&message(vec![]), 1).is_ok());
        assert!(create_filter_deflate(&message(vec![10]), 1).is_err());
    }
}
