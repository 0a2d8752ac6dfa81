//! Header and block checks applied to downloaded data before it is stored

use chainsync_core::{Block, BlockHeader};
use std::sync::Arc;

/// Most uncles a block may reference
pub const MAX_UNCLE_COUNT: usize = 10;

pub trait HeaderValidationRule: Send + Sync {
    fn is_valid(&self, header: &BlockHeader) -> bool;
}

pub trait ParentDependentValidationRule: Send + Sync {
    fn is_valid(&self, header: &BlockHeader, parent: &BlockHeader) -> bool;
}

pub trait BlockValidationRule: Send + Sync {
    fn is_valid(&self, block: &Block) -> bool;
}

/// Every block must contribute work
#[derive(Debug, Default, Clone, Copy)]
pub struct DifficultyRule;

impl HeaderValidationRule for DifficultyRule {
    fn is_valid(&self, header: &BlockHeader) -> bool {
        header.difficulty.value() > 0
    }
}

/// Hash and height link to the parent, and time never runs backwards
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentLinkRule;

impl ParentDependentValidationRule for ParentLinkRule {
    fn is_valid(&self, header: &BlockHeader, parent: &BlockHeader) -> bool {
        parent.is_parent_of(header) && header.timestamp >= parent.timestamp
    }
}

/// The body reproduces the roots its header commits to
#[derive(Debug, Clone, Copy)]
pub struct BodyRootsRule {
    max_uncle_count: usize,
}

impl Default for BodyRootsRule {
    fn default() -> Self {
        Self {
            max_uncle_count: MAX_UNCLE_COUNT,
        }
    }
}

impl BlockValidationRule for BodyRootsRule {
    fn is_valid(&self, block: &Block) -> bool {
        block.body().uncles.len() <= self.max_uncle_count && block.body().matches(block.header())
    }
}

/// The rule set consulted by the sync states
#[derive(Clone)]
pub struct SyncValidationRules {
    pub header: Arc<dyn HeaderValidationRule>,
    pub parent: Arc<dyn ParentDependentValidationRule>,
    pub block: Arc<dyn BlockValidationRule>,
}

impl Default for SyncValidationRules {
    fn default() -> Self {
        Self {
            header: Arc::new(DifficultyRule),
            parent: Arc::new(ParentLinkRule),
            block: Arc::new(BodyRootsRule::default()),
        }
    }
}

impl SyncValidationRules {
    /// `header` extends `parent` and passes both header rules
    pub fn header_extends(&self, header: &BlockHeader, parent: &BlockHeader) -> bool {
        parent.is_parent_of(header) && self.parent.is_valid(header, parent) && self.header.is_valid(header)
    }

    pub fn block_is_valid(&self, block: &Block) -> bool {
        self.block.is_valid(block)
    }
}
