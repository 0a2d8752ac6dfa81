//! Shared wiring for the sync integration tests

#![allow(dead_code)]

use chainsync_core::{Block, BlockDifficulty};
use node::config::SyncConfig;
use node::network::sync::{PeerScoreBoard, SnapshotProcessor, SyncProcessor, SyncValidationRules};
use node::simulation::{store_from_chain, SimulatedPeer, Simulation};
use node::storage::{BlockStore, MemoryBlockStore};
use std::sync::Arc;
use std::time::Duration;

pub const DIFFICULTY: BlockDifficulty = BlockDifficulty(10);
pub const TICK: Duration = Duration::from_millis(500);

/// Test settings with room for a thousand blocks in a single attempt
pub fn config() -> SyncConfig {
    let mut config = SyncConfig::immediate_for_testing();
    config.max_skeleton_chunks = 20;
    config
}

pub struct Harness {
    pub simulation: Simulation,
    pub store: Arc<dyn BlockStore>,
    pub scores: Arc<PeerScoreBoard>,
}

impl Harness {
    pub fn new(config: SyncConfig, store: Arc<dyn BlockStore>, genesis: Block) -> Self {
        Self::build(config, store, genesis, None)
    }

    pub fn build(
        config: SyncConfig,
        store: Arc<dyn BlockStore>,
        genesis: Block,
        snapshot: Option<Box<dyn SnapshotProcessor>>,
    ) -> Self {
        let scores = Arc::new(PeerScoreBoard::new());
        let mut processor = SyncProcessor::new(
            config,
            Arc::clone(&store),
            genesis,
            scores.clone(),
            SyncValidationRules::default(),
        );
        if let Some(snapshot) = snapshot {
            processor = processor.with_snapshot_processor(snapshot);
        }
        Self {
            simulation: Simulation::new(processor, TICK),
            store,
            scores,
        }
    }

    /// Node holding nothing but the genesis of `chain`
    pub fn fresh(config: SyncConfig, chain: &[Block]) -> Self {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::with_genesis(&chain[0]));
        Self::new(config, store, chain[0].clone())
    }

    /// Node holding `chain[min..=max]` only
    pub fn with_range(config: SyncConfig, chain: &[Block], min: u64, max: u64) -> Self {
        let store: Arc<dyn BlockStore> = Arc::new(store_from_chain(chain, min, max).expect("store builds"));
        Self::new(config, store, chain[0].clone())
    }

    /// Run until sync has settled at `height` or `max_ticks` pass
    pub fn sync_to(&mut self, height: u64, max_ticks: usize) -> bool {
        let store = Arc::clone(&self.store);
        self.simulation
            .run_until(max_ticks, |p| !p.is_syncing() && store.best_number() >= height)
    }
}

pub fn peer(label: &str, chain: &[Block]) -> SimulatedPeer {
    SimulatedPeer::from_chain(label, chain, config().chunk_size).expect("peer chain is not empty")
}

/// Total difficulty at the tip of `chain`
pub fn tip_difficulty(chain: &[Block]) -> BlockDifficulty {
    chain
        .iter()
        .fold(BlockDifficulty::ZERO, |acc, b| acc + b.cumulative_difficulty())
}
