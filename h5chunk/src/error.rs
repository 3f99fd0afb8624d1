use h5chunk_grid::{ArrayIndices, IncompatibleDimensionalityError, SelectionError};
use h5chunk_storage::StorageError;
use thiserror::Error;

use crate::filter::{FilterCreateError, FilterError};

/// The broad classes of [`ChunkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkErrorKind {
    /// File space could not be allocated for a chunk.
    Allocation,
    /// A filtered chunk is too large for its encoded length field.
    EncodingOverflow,
    /// The chunk index is inconsistent.
    Lookup,
    /// A filter step failed.
    Filter,
    /// The underlying storage failed.
    IO,
    /// The caller broke a precondition.
    Contract,
}

/// A chunk engine error.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChunkError {
    /// File space could not be allocated.
    #[error("unable to allocate {length} bytes of file space: {source}")]
    AllocationError {
        /// The requested length.
        length: u64,
        /// The underlying error.
        source: StorageError,
    },
    /// A chunk length cannot be encoded.
    #[error("encoded chunk length {length} needs {needed} bytes, only {allowed} are available")]
    EncodingOverflow {
        /// The encoded chunk length.
        length: u64,
        /// The number of bytes needed to encode the length.
        needed: u32,
        /// The number of bytes available to encode the length.
        allowed: u32,
    },
    /// The chunk index is inconsistent.
    #[error("chunk index lookup failed: {0}")]
    LookupError(String),
    /// A filter error.
    #[error(transparent)]
    FilterError(#[from] FilterError),
    /// A filter could not be created.
    #[error(transparent)]
    FilterCreateError(#[from] FilterCreateError),
    /// A storage error.
    #[error(transparent)]
    IOError(#[from] StorageError),
    /// Incompatible dimensionality.
    #[error(transparent)]
    IncompatibleDimensionality(#[from] IncompatibleDimensionalityError),
    /// An invalid selection.
    #[error(transparent)]
    InvalidSelection(#[from] SelectionError),
    /// An invalid chunk shape.
    #[error("invalid chunk shape: {0}")]
    InvalidChunkShape(String),
    /// A chunk is larger than the maximum chunk size.
    #[error("chunk of {0} bytes exceeds the maximum chunk size")]
    ChunkTooLarge(u64),
    /// A chunk does not exist.
    #[error("chunk {0:?} does not exist")]
    ChunkNotFound(ArrayIndices),
    /// An invalid dataset extent.
    #[error("invalid extent: {0}")]
    InvalidExtent(String),
    /// A buffer does not match the size of a selection.
    #[error("buffer of {got} bytes, expected {expected}")]
    InvalidBufferSize {
        /// The buffer size.
        got: usize,
        /// The expected size.
        expected: usize,
    },
    /// The file and memory selections differ in their number of elements.
    #[error("file selection of {file} elements does not match memory selection of {memory} elements")]
    SelectionMismatch {
        /// The number of elements selected in the file.
        file: u64,
        /// The number of elements selected in memory.
        memory: u64,
    },
    /// The file is read only.
    #[error("the file is read only")]
    ReadOnly,
    /// An unsupported operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An operation was attempted on an entry in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ChunkError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ChunkErrorKind {
        match self {
            Self::AllocationError { .. } => ChunkErrorKind::Allocation,
            Self::EncodingOverflow { .. } => ChunkErrorKind::EncodingOverflow,
            Self::LookupError(_) => ChunkErrorKind::Lookup,
            Self::FilterError(_) | Self::FilterCreateError(_) => ChunkErrorKind::Filter,
            Self::IOError(StorageError::ReadOnly) => ChunkErrorKind::Contract,
            Self::IOError(_) => ChunkErrorKind::IO,
            Self::IncompatibleDimensionality(_)
            | Self::InvalidSelection(_)
            | Self::InvalidChunkShape(_)
            | Self::ChunkTooLarge(_)
            | Self::ChunkNotFound(_)
            | Self::InvalidExtent(_)
            | Self::InvalidBufferSize { .. }
            | Self::SelectionMismatch { .. }
            | Self::ReadOnly
            | Self::Unsupported(_)
            | Self::InvalidState(_) => ChunkErrorKind::Contract,
        }
    }
}

impl From<&str> for ChunkError {
    fn from(err: &str) -> Self {
        Self::LookupError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_error_kind() {
        let err = ChunkError::AllocationError {
            length: 8,
            source: StorageError::AllocationFailed(8),
        };
        assert_eq!(err.kind(), ChunkErrorKind::Allocation);
        assert_eq!(
            ChunkError::from(FilterError::from("bad")).kind(),
            ChunkErrorKind::Filter
        );
        assert_eq!(
            ChunkError::from(StorageError::from("short read")).kind(),
            ChunkErrorKind::IO
        );
        assert_eq!(ChunkError::from(StorageError::ReadOnly).kind(), ChunkErrorKind::Contract);
        assert_eq!(ChunkError::from("corrupt").kind(), ChunkErrorKind::Lookup);
    }
}
