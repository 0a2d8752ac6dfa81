use super::StorageError;
use chainsync_core::{Block, BlockDifficulty, Hash256};

/// Block persistence as seen by the sync component.
///
/// Writes only ever connect a block whose parent is already stored (or the
/// genesis block), so implementations never see a dangling parent from sync.
pub trait BlockStore: Send + Sync {
    /// Persist a block with the total difficulty of the chain it closes.
    ///
    /// With `main_chain` set, a block whose `total_difficulty` beats the
    /// current best becomes the best and the canonical index is rewritten
    /// back to where its ancestors meet it. A lighter block only joins the
    /// index when it is the parent of the lowest canonical block. Every
    /// other block is stored off the index.
    fn save(
        &self,
        block: &Block,
        total_difficulty: BlockDifficulty,
        main_chain: bool,
    ) -> Result<(), StorageError>;

    /// Canonical block at a height
    fn get_by_number(&self, number: u64) -> Option<Block>;

    /// Any stored block by hash
    fn get_by_hash(&self, hash: &Hash256) -> Option<Block>;

    /// Highest total difficulty block
    fn best_block(&self) -> Option<Block>;

    /// Lowest canonical height currently stored
    fn min_number(&self) -> u64;

    /// Total difficulty recorded for a stored block
    fn total_difficulty_for(&self, hash: &Hash256) -> Option<BlockDifficulty>;

    fn contains(&self, hash: &Hash256) -> bool {
        self.get_by_hash(hash).is_some()
    }

    fn best_number(&self) -> u64 {
        self.best_block().map(|b| b.number()).unwrap_or(0)
    }

    fn best_total_difficulty(&self) -> BlockDifficulty {
        self.best_block()
            .and_then(|b| self.total_difficulty_for(&b.hash()))
            .unwrap_or(BlockDifficulty::ZERO)
    }
}
