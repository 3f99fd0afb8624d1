//! Array subset and chunk coordinate iterators.

mod chunk_odometer;
mod indices_iterator;

pub use chunk_odometer::ChunkOdometer;
pub use indices_iterator::{Indices, IndicesIntoIterator};
