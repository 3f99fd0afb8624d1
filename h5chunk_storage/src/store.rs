//! Block stores.

mod filesystem_store;
mod memory_store;

pub use filesystem_store::{FilesystemBlockStore, FilesystemBlockStoreCreateError};
pub use memory_store::MemoryBlockStore;
