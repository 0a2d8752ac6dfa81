// Chainsync core library
// Chain value types shared by the sync node and its collaborators

pub mod error;
pub mod hash;
pub mod types;

pub use error::ChainError;
pub use hash::{hash256, Hash256};
pub use types::block::{
    Block, BlockBody, BlockDifficulty, BlockHeader, BlockIdentifier, Transaction,
};
