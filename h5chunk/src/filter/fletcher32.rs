//! The `fletcher32` filter.
//!
//! Appends a fletcher32 checksum of the chunk as four little endian bytes.
//! The checksum sums the chunk as big endian 16-bit words, a trailing odd byte is the high byte of a final word.
//! Decoding strips the checksum and, if [checksum validation](crate::config::Config#validate-checksums) is enabled, verifies it.

use std::sync::Arc;

use super::{
    Filter, FilterCreateError, FilterError, FilterId, FilterMessage, FilterOptions, FilterPlugin,
    FilterTraits, FILTER_FLETCHER32,
};

const CHECKSUM_SIZE: usize = 4;

inventory::submit! {
    FilterPlugin::new(FILTER_FLETCHER32, create_filter_fletcher32)
}

fn create_filter_fletcher32(
    _message: &FilterMessage,
    _element_size: usize,
) -> Result<Filter, FilterCreateError> {
    Ok(Arc::new(Fletcher32Filter))
}

/// Compute the fletcher32 checksum of `data`.
#[must_use]
pub(crate) fn fletcher32(data: &[u8]) -> u32 {
    // 360 words keep both running sums within a u32 before reduction.
    const BLOCK_BYTES: usize = 720;
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut blocks = data.chunks_exact(BLOCK_BYTES);
    for block in &mut blocks {
        for word in block.chunks_exact(2) {
            sum1 += u32::from(u16::from_be_bytes([word[0], word[1]]));
            sum2 += sum1;
        }
        sum1 %= 65535;
        sum2 %= 65535;
    }
    for word in blocks.remainder().chunks(2) {
        let value = match word {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from(*hi) << 8,
            _ => 0,
        };
        sum1 = (sum1 + u32::from(value)) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}

/// A `fletcher32` filter implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fletcher32Filter;

impl FilterTraits for Fletcher32Filter {
    fn id(&self) -> FilterId {
        FILTER_FLETCHER32
    }

    fn name(&self) -> &'static str {
        "fletcher32"
    }

    fn client_data(&self) -> Vec<u32> {
        vec![]
    }

    fn encode(&self, decoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let checksum = fletcher32(decoded);
        let mut encoded = Vec::with_capacity(decoded.len() + CHECKSUM_SIZE);
        encoded.extend_from_slice(decoded);
        encoded.extend_from_slice(&checksum.to_le_bytes());
        Ok(encoded)
    }

    fn decode(&self, encoded: &[u8], options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
        let Some(split) = encoded.len().checked_sub(CHECKSUM_SIZE) else {
            return Err(FilterError::InvalidInput(
                self.name(),
                format!("{} bytes is too short to hold a checksum", encoded.len()),
            ));
        };
        let (payload, checksum) = encoded.split_at(split);
        if options.validate_checksums() {
            let mut stored = [0; CHECKSUM_SIZE];
            stored.copy_from_slice(checksum);
            let stored = u32::from_le_bytes(stored);
            let computed = fletcher32(payload);
            if stored != computed {
                return Err(FilterError::InvalidChecksum { stored, computed });
            }
        }
        Ok(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_fletcher32_checksum() {
        assert_eq!(fletcher32(&[0; 16]), 0);
        // words 0x0102, 0x0300
        let sum1 = 0x0102 + 0x0300;
        let sum2 = 0x0102 + sum1;
        assert_eq!(fletcher32(&[1, 2, 3]), (sum2 << 16) | sum1);
        let long: Vec<u8> = (0..2000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut naive = (0u32, 0u32);
        for word in long.chunks(2) {
            let value = u32::from(word[0]) << 8 | u32::from(*word.get(1).unwrap_or(&0));
            naive.0 = (naive.0 + value) % 65535;
            naive.1 = (naive.1 + naive.0) % 65535;
        }
        assert_eq!(fletcher32(&long), (naive.1 << 16) | naive.0);
    }

    #[test]
    fn filter_fletcher32_verify() -> Result<(), FilterError> {
        let options = FilterOptions::default().with_validate_checksums(true);
        let mut encoded = Fletcher32Filter.encode(&[1, 2, 3, 4], &options)?;
        assert_eq!(encoded.len(), 8);
        assert_eq!(Fletcher32Filter.decode(&encoded, &options)?, vec![1, 2, 3, 4]);
        encoded[0] ^= 0xff;
        assert!(matches!(
            Fletcher32Filter.decode(&encoded, &options),
            Err(FilterError::InvalidChecksum { .. })
        ));
        let options = options.with_validate_checksums(false);
        assert_eq!(Fletcher32Filter.decode(&encoded, &options)?.len(), 4);
        assert!(Fletcher32Filter.decode(&[1, 2], &options).is_err());
        Ok(())
    }
}
