//! Chunk filters and the filter pipeline.
//!
//! A [`FilterPipeline`] is an ordered list of reversible byte transforms applied to a chunk before it is written, and reversed after it is read.
//! Filters are created from persisted [`FilterMessage`]s through the [`FilterPlugin`] registry, keyed by numeric filter id.
//!
//! Built-in filters:
//! - [`DeflateFilter`] (id `1`): a zlib stream,
//! - [`ShuffleFilter`] (id `2`): a byte shuffle by element size, and
//! - [`Fletcher32Filter`] (id `3`): a trailing fletcher32 checksum.
//!
//! A step flagged [`FilterFlags::OPTIONAL`] that fails on write is skipped, and the skip is recorded in the chunk's [`FilterMask`].

mod deflate;
mod fletcher32;
mod shuffle;

use std::sync::Arc;

use bitflags::bitflags;
use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use deflate::DeflateFilter;
pub use fletcher32::Fletcher32Filter;
pub use shuffle::ShuffleFilter;

use crate::config::global_config;

/// A numeric filter identifier.
pub type FilterId = u16;

/// The filter id of [`DeflateFilter`].
pub const FILTER_DEFLATE: FilterId = 1;

/// The filter id of [`ShuffleFilter`].
pub const FILTER_SHUFFLE: FilterId = 2;

/// The filter id of [`Fletcher32Filter`].
pub const FILTER_FLETCHER32: FilterId = 3;

bitflags! {
    /// Per-step filter flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FilterFlags: u16 {
        /// The step may fail on write without failing the write.
        const OPTIONAL = 0x0001;
    }
}

/// A chunk filter mask.
///
/// Bit `i` set means step `i` of the pipeline was not applied to the stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Deref, From)]
pub struct FilterMask(u32);

impl FilterMask {
    /// A mask with every step applied.
    pub const NONE: Self = Self(0);

    /// Create a filter mask from its bits.
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Return the mask bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if step `step` was not applied.
    #[must_use]
    pub const fn is_excluded(self, step: usize) -> bool {
        step < 32 && self.0 & (1 << step) != 0
    }

    /// Mark step `step` as not applied.
    pub fn exclude(&mut self, step: usize) {
        if step < 32 {
            self.0 |= 1 << step;
        }
    }
}

impl std::fmt::Display for FilterMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// One step of a persisted filter pipeline message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMessage {
    /// The filter id.
    pub id: FilterId,
    /// The step flags.
    #[serde(default)]
    pub flags: FilterFlags,
    /// An optional filter name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Filter parameters.
    #[serde(default)]
    pub client_data: Vec<u32>,
}

/// A filter error.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FilterError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] Arc<std::io::Error>),
    /// A stored checksum does not match the computed checksum.
    #[error("checksum mismatch, stored {stored:#010x} computed {computed:#010x}")]
    InvalidChecksum {
        /// The stored checksum.
        stored: u32,
        /// The computed checksum.
        computed: u32,
    },
    /// The input of a filter is invalid.
    #[error("invalid input to filter {0}: {1}")]
    InvalidInput(&'static str, String),
    /// A filter is unavailable.
    #[error("filter {0} is unavailable")]
    UnknownFilter(FilterId),
    /// Other.
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for FilterError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

impl From<&str> for FilterError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for FilterError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

/// A filter creation error.
#[derive(Clone, Debug, Error)]
pub enum FilterCreateError {
    /// No filter is registered for the id.
    #[error("filter {0} is not registered")]
    Unregistered(FilterId),
    /// The filter parameters are invalid.
    #[error("invalid parameters {client_data:?} for filter {id}")]
    InvalidParameters {
        /// The filter id.
        id: FilterId,
        /// The parameters.
        client_data: Vec<u32>,
    },
}

/// Filter options.
#[derive(Debug, Clone, Copy)]
pub struct FilterOptions {
    validate_checksums: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            validate_checksums: global_config().validate_checksums(),
        }
    }
}

impl FilterOptions {
    /// Returns true if error detecting filters should validate checksums.
    #[must_use]
    pub const fn validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    /// Set whether error detecting filters should validate checksums.
    #[must_use]
    pub const fn with_validate_checksums(mut self, validate_checksums: bool) -> Self {
        self.validate_checksums = validate_checksums;
        self
    }
}

/// Filter traits.
pub trait FilterTraits: std::fmt::Debug + Send + Sync {
    /// The filter id.
    fn id(&self) -> FilterId;

    /// The filter name.
    fn name(&self) -> &'static str;

    /// The parameters persisted in the filter message.
    fn client_data(&self) -> Vec<u32>;

    /// Encode `decoded`.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if encoding fails.
    fn encode(&self, decoded: &[u8], options: &FilterOptions) -> Result<Vec<u8>, FilterError>;

    /// Decode `encoded`.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if `encoded` is invalid or a checksum does not match.
    fn decode(&self, encoded: &[u8], options: &FilterOptions) -> Result<Vec<u8>, FilterError>;
}

/// A shared filter.
pub type Filter = Arc<dyn FilterTraits>;

/// A filter plugin.
pub struct FilterPlugin {
    id: FilterId,
    create_fn: fn(message: &FilterMessage, element_size: usize) -> Result<Filter, FilterCreateError>,
}

inventory::collect!(FilterPlugin);

impl FilterPlugin {
    /// Create a new filter plugin for registration.
    pub const fn new(
        id: FilterId,
        create_fn: fn(
            message: &FilterMessage,
            element_size: usize,
        ) -> Result<Filter, FilterCreateError>,
    ) -> Self {
        Self { id, create_fn }
    }

    /// The filter id of this plugin.
    #[must_use]
    pub const fn id(&self) -> FilterId {
        self.id
    }

    /// Create a filter from `message`.
    ///
    /// # Errors
    /// Returns a [`FilterCreateError`] if the message parameters are invalid.
    pub fn create(
        &self,
        message: &FilterMessage,
        element_size: usize,
    ) -> Result<Filter, FilterCreateError> {
        (self.create_fn)(message, element_size)
    }
}

/// Create a filter from a filter message.
///
/// # Errors
/// Returns a [`FilterCreateError`] if no plugin is registered for the filter id or the message is invalid.
pub fn create_filter(message: &FilterMessage, element_size: usize) -> Result<Filter, FilterCreateError> {
    for plugin in inventory::iter::<FilterPlugin> {
        if plugin.id() == message.id {
            return plugin.create(message, element_size);
        }
    }
    Err(FilterCreateError::Unregistered(message.id))
}

#[derive(Debug, Clone)]
struct FilterStep {
    filter: Filter,
    flags: FilterFlags,
}

/// An ordered filter pipeline.
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    steps: Vec<FilterStep>,
}

impl FilterPipeline {
    /// Create an empty filter pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter pipeline from a persisted pipeline message.
    ///
    /// # Errors
    /// Returns a [`FilterCreateError`] if a filter is unregistered or has invalid parameters.
    pub fn from_messages(
        messages: &[FilterMessage],
        element_size: usize,
    ) -> Result<Self, FilterCreateError> {
        let steps = messages
            .iter()
            .map(|message| {
                Ok(FilterStep {
                    filter: create_filter(message, element_size)?,
                    flags: message.flags,
                })
            })
            .collect::<Result<Vec<_>, FilterCreateError>>()?;
        Ok(Self { steps })
    }

    /// Append a filter step.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter, flags: FilterFlags) -> Self {
        self.steps.push(FilterStep { filter, flags });
        self
    }

    /// Append a [`DeflateFilter`] step with compression `level`.
    #[must_use]
    pub fn with_deflate(self, level: u32) -> Self {
        self.with_filter(Arc::new(DeflateFilter::new(level)), FilterFlags::OPTIONAL)
    }

    /// Append a [`DeflateFilter`] step with the configured [deflate level](crate::config::Config#deflate-level).
    #[must_use]
    pub fn with_deflate_default(self) -> Self {
        let level = global_config().deflate_level();
        self.with_deflate(level)
    }

    /// Append a [`ShuffleFilter`] step for elements of `element_size` bytes.
    #[must_use]
    pub fn with_shuffle(self, element_size: usize) -> Self {
        self.with_filter(
            Arc::new(ShuffleFilter::new(element_size)),
            FilterFlags::OPTIONAL,
        )
    }

    /// Append a [`Fletcher32Filter`] step.
    #[must_use]
    pub fn with_fletcher32(self) -> Self {
        self.with_filter(Arc::new(Fletcher32Filter), FilterFlags::empty())
    }

    /// Returns true if the pipeline has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Return the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the pipeline has a step with filter id `id`.
    #[must_use]
    pub fn contains(&self, id: FilterId) -> bool {
        self.steps.iter().any(|step| step.filter.id() == id)
    }

    /// Return the persisted pipeline message.
    #[must_use]
    pub fn messages(&self) -> Vec<FilterMessage> {
        self.steps
            .iter()
            .map(|step| FilterMessage {
                id: step.filter.id(),
                flags: step.flags,
                name: Some(step.filter.name().to_string()),
                client_data: step.filter.client_data(),
            })
            .collect()
    }

    /// Apply the pipeline to decoded chunk bytes.
    ///
    /// Returns the encoded bytes and the mask of steps that were skipped.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if a step that is not [optional](FilterFlags::OPTIONAL) fails.
    pub fn apply(
        &self,
        decoded: Vec<u8>,
        options: &FilterOptions,
    ) -> Result<(Vec<u8>, FilterMask), FilterError> {
        let mut mask = FilterMask::NONE;
        let mut data = decoded;
        for (i, step) in self.steps.iter().enumerate() {
            match step.filter.encode(&data, options) {
                Ok(encoded) => data = encoded,
                Err(err) if step.flags.contains(FilterFlags::OPTIONAL) => {
                    log::debug!("optional filter {} skipped: {err}", step.filter.name());
                    mask.exclude(i);
                }
                Err(err) => return Err(err),
            }
        }
        Ok((data, mask))
    }

    /// Reverse the pipeline on encoded chunk bytes, skipping the steps excluded by `mask`.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if any step fails.
    pub fn reverse(
        &self,
        encoded: Vec<u8>,
        mask: FilterMask,
        options: &FilterOptions,
    ) -> Result<Vec<u8>, FilterError> {
        let mut data = encoded;
        for (i, step) in self.steps.iter().enumerate().rev() {
            if mask.is_excluded(i) {
                continue;
            }
            data = step.filter.decode(&data, options)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FailingFilter;

    impl FilterTraits for FailingFilter {
        fn id(&self) -> FilterId {
            256
        }

        fn name(&self) -> &'static str {
            "failing"
        }

        fn client_data(&self) -> Vec<u32> {
            vec![]
        }

        fn encode(&self, _decoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
            Err("always fails".into())
        }

        fn decode(&self, _encoded: &[u8], _options: &FilterOptions) -> Result<Vec<u8>, FilterError> {
            Err("always fails".into())
        }
    }

    #[test]
    fn filter_pipeline_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let pipeline = FilterPipeline::new()
            .with_shuffle(4)
            .with_deflate(6)
            .with_fletcher32();
        let decoded: Vec<u8> = (0..256u32).flat_map(u32::to_ne_bytes).collect();
        let options = FilterOptions::default();
        let (encoded, mask) = pipeline.apply(decoded.clone(), &options)?;
        assert_eq!(mask, FilterMask::NONE);
        assert!(encoded.len() < decoded.len());
        assert_eq!(pipeline.reverse(encoded, mask, &options)?, decoded);
        Ok(())
    }

    #[test]
    fn filter_pipeline_messages() -> Result<(), Box<dyn std::error::Error>> {
        let pipeline = FilterPipeline::new().with_shuffle(8).with_deflate(3);
        let messages = pipeline.messages();
        assert_eq!(messages[0].id, FILTER_SHUFFLE);
        assert_eq!(messages[0].client_data, vec![8]);
        assert_eq!(messages[1].id, FILTER_DEFLATE);
        assert!(messages[1].flags.contains(FilterFlags::OPTIONAL));
        let json = serde_json::to_string(&messages)?;
        let messages: Vec<FilterMessage> = serde_json::from_str(&json)?;
        let pipeline = FilterPipeline::from_messages(&messages, 8)?;
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.contains(FILTER_DEFLATE));
        assert!(matches!(
            FilterPipeline::from_messages(
                &[FilterMessage {
                    id: 999,
                    flags: FilterFlags::empty(),
                    name: None,
                    client_data: vec![]
                }],
                1
            ),
            Err(FilterCreateError::Unregistered(999))
        ));
        Ok(())
    }

    #[test]
    fn filter_pipeline_optional_step() -> Result<(), Box<dyn std::error::Error>> {
        let options = FilterOptions::default();
        let pipeline = FilterPipeline::new()
            .with_filter(Arc::new(FailingFilter), FilterFlags::OPTIONAL)
            .with_fletcher32();
        let (encoded, mask) = pipeline.apply(vec![1, 2, 3, 4], &options)?;
        assert!(mask.is_excluded(0));
        assert!(!mask.is_excluded(1));
        assert_eq!(encoded.len(), 8);
        assert_eq!(pipeline.reverse(encoded, mask, &options)?, vec![1, 2, 3, 4]);

        let pipeline = FilterPipeline::new().with_filter(Arc::new(FailingFilter), FilterFlags::empty());
        assert!(pipeline.apply(vec![1, 2, 3, 4], &options).is_err());
        Ok(())
    }

    #[test]
    fn filter_mask() {
        let mut mask = FilterMask::NONE;
        mask.exclude(2);
        assert!(mask.is_excluded(2));
        assert!(!mask.is_excluded(1));
        assert!(!mask.is_excluded(40));
        assert_eq!(mask.bits(), 4);
        assert_eq!(mask.to_string(), "0x00000004");
    }
}
