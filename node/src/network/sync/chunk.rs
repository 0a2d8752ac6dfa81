use chainsync_core::hash::short_hex;
use chainsync_core::Hash256;
use std::fmt;

/// One header-download request: `count` headers ending at `hash`,
/// walking toward genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    hash: Hash256,
    count: u32,
}

impl ChunkDescriptor {
    pub fn new(hash: Hash256, count: u32) -> Self {
        Self { hash, count }
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl fmt::Display for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} headers ending at {}", self.count, short_hex(&self.hash))
    }
}
