pub mod memory;
pub mod traits;

pub use memory::MemoryBlockStore;
pub use traits::BlockStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
}
