use super::{BlockStore, StorageError};
use chainsync_core::hash::short_hex;
use chainsync_core::{Block, BlockDifficulty, Hash256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

struct StoredBlock {
    block: Block,
    total_difficulty: BlockDifficulty,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<Hash256, StoredBlock>,
    canonical: BTreeMap<u64, Hash256>,
    best: Option<Hash256>,
}

/// Simple in-memory block store
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: RwLock<Inner>,
}

impl Inner {
    /// Make `hash` the canonical tip at `number`, rewriting its ancestors
    /// back to where they meet the previous canonical chain
    fn reorganize(&mut self, number: u64, hash: Hash256) {
        // blocks above the new best belong to a lighter chain
        let stale: Vec<u64> = self.canonical.range(number + 1..).map(|(n, _)| *n).collect();
        for n in stale {
            self.canonical.remove(&n);
        }

        let mut height = number;
        let mut current = hash;
        loop {
            if self.canonical.insert(height, current) == Some(current) || height == 0 {
                break;
            }
            let Some(parent) = self.blocks.get(&current).map(|b| *b.block.parent_hash()) else {
                break;
            };
            if !self.blocks.contains_key(&parent) {
                break;
            }
            height -= 1;
            current = parent;
        }
    }

    /// A lighter block still belongs on the index when it is the parent of
    /// the lowest canonical block, as happens while backfilling
    fn extends_canonical_downwards(&self, number: u64, hash: &Hash256) -> bool {
        self.canonical
            .get(&(number + 1))
            .and_then(|child| self.blocks.get(child))
            .map_or(false, |child| child.block.parent_hash() == hash)
    }
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a genesis block as best
    pub fn with_genesis(genesis: &Block) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            let hash = genesis.hash();
            inner.blocks.insert(
                hash,
                StoredBlock {
                    block: genesis.clone(),
                    total_difficulty: genesis.cumulative_difficulty(),
                },
            );
            inner.canonical.insert(genesis.number(), hash);
            inner.best = Some(hash);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn save(
        &self,
        block: &Block,
        total_difficulty: BlockDifficulty,
        main_chain: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let number = block.number();

        inner.blocks.insert(
            hash,
            StoredBlock {
                block: block.clone(),
                total_difficulty,
            },
        );

        let best_td = inner
            .best
            .and_then(|best| inner.blocks.get(&best))
            .map(|stored| stored.total_difficulty);
        let is_new_best = match best_td {
            None => true,
            Some(best_td) => total_difficulty > best_td,
        };

        if main_chain && is_new_best {
            inner.best = Some(hash);
            inner.reorganize(number, hash);
        } else if main_chain && inner.extends_canonical_downwards(number, &hash) {
            inner.canonical.insert(number, hash);
        }

        trace!(
            "Stored block #{} {} td={} main_chain={}",
            number,
            short_hex(&hash),
            total_difficulty,
            main_chain
        );
        Ok(())
    }

    fn get_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .canonical
            .get(&number)
            .and_then(|hash| inner.blocks.get(hash))
            .map(|stored| stored.block.clone())
    }

    fn get_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.inner.read().blocks.get(hash).map(|stored| stored.block.clone())
    }

    fn best_block(&self) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .best
            .and_then(|hash| inner.blocks.get(&hash))
            .map(|stored| stored.block.clone())
    }

    fn min_number(&self) -> u64 {
        self.inner
            .read()
            .canonical
            .keys()
            .next()
            .copied()
            .unwrap_or(0)
    }

    fn total_difficulty_for(&self, hash: &Hash256) -> Option<BlockDifficulty> {
        self.inner
            .read()
            .blocks
            .get(hash)
            .map(|stored| stored.total_difficulty)
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::BlockBody;

    fn chain(len: u64) -> Vec<Block> {
        let mut blocks = vec![Block::genesis(BlockDifficulty(1), 0)];
        for n in 1..len {
            let parent = blocks[(n - 1) as usize].header().clone();
            blocks.push(Block::child_of(&parent, BlockBody::default(), BlockDifficulty(2), n, 0));
        }
        blocks
    }

    /// `len` blocks on `branch` on top of `base`
    fn fork(base: &Block, len: u64, branch: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for n in 0..len {
            let parent = blocks.last().unwrap_or(base).header().clone();
            let number = parent.number + 1;
            blocks.push(Block::child_of(&parent, BlockBody::default(), BlockDifficulty(2), number, branch));
        }
        blocks
    }

    /// Save `blocks` as main chain candidates, each with its real total
    /// difficulty on top of `base_td`
    fn save_all(store: &MemoryBlockStore, blocks: &[Block], base_td: u128) {
        let mut td = base_td;
        for block in blocks {
            td += block.cumulative_difficulty().value();
            store.save(block, BlockDifficulty(td), true).unwrap();
        }
    }

    fn td_of(store: &MemoryBlockStore, block: &Block) -> u128 {
        store.total_difficulty_for(&block.hash()).unwrap().value()
    }

    #[test]
    fn test_best_moves_only_on_higher_difficulty() {
        let blocks = chain(3);
        let store = MemoryBlockStore::with_genesis(&blocks[0]);

        store.save(&blocks[1], BlockDifficulty(3), true).unwrap();
        assert_eq!(store.best_number(), 1);

        store.save(&blocks[2], BlockDifficulty(2), true).unwrap();
        assert_eq!(store.best_number(), 1);
        assert!(store.get_by_number(2).is_none());
    }

    #[test]
    fn test_min_number_tracks_backfill() {
        let blocks = chain(4);
        let store = MemoryBlockStore::new();

        store.save(&blocks[3], BlockDifficulty(7), true).unwrap();
        assert_eq!(store.min_number(), 3);

        store.save(&blocks[2], BlockDifficulty(5), true).unwrap();
        assert_eq!(store.min_number(), 2);
        assert_eq!(store.best_number(), 3);
        assert_eq!(store.total_difficulty_for(&blocks[2].hash()), Some(BlockDifficulty(5)));
    }

    #[test]
    fn test_side_block_not_canonical() {
        let blocks = chain(2);
        let store = MemoryBlockStore::with_genesis(&blocks[0]);

        store.save(&blocks[1], BlockDifficulty(3), false).unwrap();
        assert!(store.contains(&blocks[1].hash()));
        assert!(store.get_by_number(1).is_none());
        assert_eq!(store.best_number(), 0);
    }

    #[test]
    fn test_lighter_fork_stays_off_the_index() {
        let blocks = chain(301);
        let store = MemoryBlockStore::with_genesis(&blocks[0]);
        save_all(&store, &blocks[1..], 1);

        let side = fork(&blocks[137], 13, 1);
        save_all(&store, &side, td_of(&store, &blocks[137]));

        assert_eq!(store.best_number(), 300);
        assert_eq!(store.best_block().map(|b| b.hash()), Some(blocks[300].hash()));
        assert_eq!(store.get_by_number(150).map(|b| b.hash()), Some(blocks[150].hash()));
        assert!(store.contains(&side[12].hash()));
    }

    #[test]
    fn test_heavier_fork_rewrites_the_index() {
        let blocks = chain(301);
        let store = MemoryBlockStore::with_genesis(&blocks[0]);
        save_all(&store, &blocks[1..], 1);

        let heavier = fork(&blocks[137], 200, 1);
        save_all(&store, &heavier, td_of(&store, &blocks[137]));

        assert_eq!(store.best_number(), 337);
        for block in &heavier {
            assert_eq!(store.get_by_number(block.number()).map(|b| b.hash()), Some(block.hash()));
        }
        assert_eq!(store.get_by_number(137).map(|b| b.hash()), Some(blocks[137].hash()));
        assert_eq!(store.get_by_number(100).map(|b| b.hash()), Some(blocks[100].hash()));
    }

    #[test]
    fn test_backfill_extends_index_downwards() {
        let blocks = chain(6);
        let store = MemoryBlockStore::new();
        save_all(&store, &blocks[3..], 100);

        store.save(&blocks[2], BlockDifficulty(90), true).unwrap();
        assert_eq!(store.min_number(), 2);

        let stranger = fork(&blocks[0], 1, 9);
        store.save(&stranger[0], BlockDifficulty(50), true).unwrap();
        assert_eq!(store.min_number(), 2);
        assert_eq!(store.best_number(), 5);
    }
}
