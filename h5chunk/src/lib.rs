//! `h5chunk` is a chunked dataset storage engine.
//!
//! A chunked dataset partitions a multidimensional array of fixed-size elements into rectangular chunks.
//! Each chunk is stored in its own region of a file, optionally passed through a filter pipeline (compression, byte shuffling, checksums), and located through a chunk index.
//!
//! The engine is made of:
//! - a [chunk layout](layout::ChunkLayout) holding the chunk shape and the chunk grid geometry of the current and maximum dataset extent,
//! - a [fill value](fill::FillValue) policy for elements that were never written,
//! - a [filter pipeline](filter::FilterPipeline) of `deflate`, `shuffle`, and `fletcher32` filters, extensible through a plugin registry,
//! - pluggable [chunk indexes](index) (none, single, fixed array, extensible array, and v1/v2 B-trees),
//! - a chunk file space allocator that moves chunks whose filtered size changes,
//! - a hash-indexed LRU [raw data chunk cache](cache::ChunkCache) of decoded chunks,
//! - a [chunk-to-selection mapper](mapper::ChunkMap) splitting file and memory selections into per-chunk pieces,
//! - a chunked I/O driver reading and writing pieces through the cache or with vectored storage requests,
//! - an extent change handler allocating, refiltering, pruning, and filling chunks when a dataset is resized, and
//! - a [collective write coordinator](collective::DistributedWriteCoordinator) for groups of cooperating writers.
//!
//! [`ChunkedDataset`] ties these together.
//!
//! ## Example
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # use std::sync::Arc;
//! use h5chunk::{fill::FillValue, filter::FilterPipeline, ChunkedDatasetBuilder};
//! use h5chunk_grid::ArraySubset;
//! use h5chunk_storage::{store::MemoryBlockStore, FileHandle, FileIntent};
//!
//! let file = FileHandle::new(Arc::new(MemoryBlockStore::new()), FileIntent::read_write())?;
//! let mut dataset = ChunkedDatasetBuilder::new(vec![8, 8], vec![4, 4], 1)
//!     .max_shape(vec![None, Some(8)])
//!     .fill_value(FillValue::new(vec![255]))
//!     .filters(FilterPipeline::new().with_shuffle(1).with_deflate(6))
//!     .build(file)?;
//!
//! dataset.write_subset(&ArraySubset::new_with_ranges(&[0..2, 0..2]), &[1, 2, 3, 4])?;
//! dataset.set_extent(&[12, 8])?;
//! let bytes = dataset.read_subset(&ArraySubset::new_with_ranges(&[1..2, 0..3]))?;
//! assert_eq!(bytes, vec![3, 4, 255]);
//! let message = dataset.close()?;
//! assert_eq!(message.shape, vec![12, 8]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//! `h5chunk` logs through the [`log`] facade: cache activity and flushes at `trace`, evictions, extent changes, and index selection at `debug`, and failures that are recovered from at `warn`.
//!
//! ## Licence
//! `h5chunk` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod cache;
pub mod collective;
pub mod config;
pub mod fill;
pub mod filter;
pub mod index;
pub mod layout;
pub mod mapper;

mod allocator;
mod context;
mod dataset;
mod error;
mod extent;
mod io;

pub use dataset::{ChunkInfo, ChunkedDataset, ChunkedDatasetBuilder, DatasetMessage};
pub use error::{ChunkError, ChunkErrorKind};
