//! Errors raised by the chain value types

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Difficulty overflow adding {0} to {1}")]
    DifficultyOverflow(u128, u128),

    #[error("Difficulty underflow subtracting {0} from {1}")]
    DifficultyUnderflow(u128, u128),

    #[error("Block {number} body does not match its header")]
    BodyMismatch { number: u64 },

    #[error("Invalid block data: {0}")]
    InvalidData(String),
}
