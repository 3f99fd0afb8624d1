//! Fill values.
//!
//! The fill value of a dataset is the content of elements that have never been written.
//! When it is materialised is governed by the [`FillTime`], when chunk storage is allocated by the [`AllocTime`].

use serde::{Deserialize, Serialize};

use crate::ChunkError;

/// The definedness of a fill value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillValueStatus {
    /// No fill value is defined.
    Undefined,
    /// The default fill value (all zero bytes).
    Default,
    /// A user defined fill value.
    UserDefined,
}

/// When fill values are written to chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillTime {
    /// Chunks are filled when they are allocated.
    Alloc,
    /// Chunks are never filled.
    Never,
    /// Chunks are filled when they are allocated if a fill value is set.
    IfSet,
}

/// When chunk storage is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocTime {
    /// Every chunk is allocated when the dataset is created or extended.
    Early,
    /// Chunks are allocated when they are first written.
    Incremental,
    /// Chunks are allocated when they are first written.
    Late,
}

/// The fill value policy of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillValue {
    status: FillValueStatus,
    fill_time: FillTime,
    alloc_time: AllocTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes: Option<Vec<u8>>,
}

impl Default for FillValue {
    fn default() -> Self {
        Self {
            status: FillValueStatus::Default,
            fill_time: FillTime::IfSet,
            alloc_time: AllocTime::Incremental,
            bytes: None,
        }
    }
}

impl FillValue {
    /// Create a user defined fill value from the bytes of one element.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            status: FillValueStatus::UserDefined,
            bytes: Some(bytes),
            ..Self::default()
        }
    }

    /// Create a user defined fill value from an element in native byte order.
    #[must_use]
    pub fn from_element<T: bytemuck::Pod>(element: T) -> Self {
        Self::new(bytemuck::bytes_of(&element).to_vec())
    }

    /// Create an undefined fill value.
    #[must_use]
    pub fn new_undefined() -> Self {
        Self {
            status: FillValueStatus::Undefined,
            ..Self::default()
        }
    }

    /// Set the fill time.
    #[must_use]
    pub const fn with_fill_time(mut self, fill_time: FillTime) -> Self {
        self.fill_time = fill_time;
        self
    }

    /// Set the allocation time.
    #[must_use]
    pub const fn with_alloc_time(mut self, alloc_time: AllocTime) -> Self {
        self.alloc_time = alloc_time;
        self
    }

    /// Return the fill value status.
    #[must_use]
    pub const fn status(&self) -> FillValueStatus {
        self.status
    }

    /// Return the fill time.
    #[must_use]
    pub const fn fill_time(&self) -> FillTime {
        self.fill_time
    }

    /// Return the allocation time.
    #[must_use]
    pub const fn alloc_time(&self) -> AllocTime {
        self.alloc_time
    }

    /// Return the user defined fill value bytes.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Check the fill value against the element size of a dataset.
    ///
    /// # Errors
    /// Returns [`ChunkError::InvalidBufferSize`] if a user defined fill value is not one element long.
    pub fn validate(&self, element_size: usize) -> Result<(), ChunkError> {
        match &self.bytes {
            Some(bytes) if bytes.len() != element_size => Err(ChunkError::InvalidBufferSize {
                got: bytes.len(),
                expected: element_size,
            }),
            _ => Ok(()),
        }
    }

    /// Returns true if fill values must be written to newly allocated chunks.
    #[must_use]
    pub fn must_write_fill(&self) -> bool {
        self.fill_time == FillTime::Alloc
            || (self.fill_time == FillTime::IfSet && self.status == FillValueStatus::UserDefined)
    }

    /// Returns true if a chunk buffer created for a chunk that was never written is initialised with the fill value rather than zero.
    #[must_use]
    pub fn fill_on_create(&self) -> bool {
        self.fill_time == FillTime::Alloc
            || (self.fill_time == FillTime::IfSet && self.status != FillValueStatus::Undefined)
    }

    /// Returns true if reads skip chunks that were never written, leaving the destination untouched.
    #[must_use]
    pub fn skip_missing_chunks(&self) -> bool {
        self.fill_time == FillTime::Never
            || (self.fill_time == FillTime::IfSet && self.status == FillValueStatus::Undefined)
    }

    /// Return the bytes of one fill element of `element_size` bytes.
    ///
    /// Default and undefined fill values are zero.
    #[must_use]
    pub fn element(&self, element_size: usize) -> Vec<u8> {
        match &self.bytes {
            Some(bytes) if self.status == FillValueStatus::UserDefined => bytes.clone(),
            _ => vec![0; element_size],
        }
    }
}

/// A buffer of fill elements.
#[derive(Debug, Clone)]
pub struct FillBuffer {
    element: Vec<u8>,
    zero: bool,
}

impl FillBuffer {
    /// Create a fill buffer for `fill_value` and elements of `element_size` bytes.
    #[must_use]
    pub fn new(fill_value: &FillValue, element_size: usize) -> Self {
        let element = fill_value.element(element_size);
        let zero = element.iter().all(|&byte| byte == 0);
        Self { element, zero }
    }

    /// Return the fill element.
    #[must_use]
    pub fn element(&self) -> &[u8] {
        &self.element
    }

    /// Return a chunk of `size` bytes filled with the fill element.
    #[must_use]
    pub fn chunk(&self, size: usize) -> Vec<u8> {
        if self.zero || self.element.is_empty() {
            vec![0; size]
        } else {
            self.element
                .iter()
                .copied()
                .cycle()
                .take(size)
                .collect()
        }
    }

    /// Fill every element of `buf`.
    pub fn fill(&self, buf: &mut [u8]) {
        if self.zero || self.element.is_empty() {
            buf.fill(0);
        } else {
            for element in buf.chunks_mut(self.element.len()) {
                element.copy_from_slice(&self.element[..element.len()]);
            }
        }
    }

    /// Fill the elements of `buf` selected by `runs` of `(element offset, element count)`.
    pub fn fill_elements(&self, buf: &mut [u8], runs: &[(u64, u64)]) {
        let element_size = self.element.len();
        for &(offset, count) in runs {
            let (Ok(offset), Ok(count)) = (usize::try_from(offset), usize::try_from(count)) else {
                continue;
            };
            let start = offset * element_size;
            let end = std::cmp::min(start + count * element_size, buf.len());
            if start < end {
                self.fill(&mut buf[start..end]);
            }
        }
    }
}
