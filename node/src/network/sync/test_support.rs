//! Fixtures shared by the sync unit tests

use super::processor::SyncCore;
use super::scoring::PeerScoreBoard;
use super::states::SyncState;
use super::validation::SyncValidationRules;
use crate::config::SyncConfig;
use crate::network::message::{Status, SyncMessage};
use crate::network::peer::{NetworkError, Peer, PeerId};
use crate::simulation::{build_chain, extend_chain, store_from_chain};
use crate::storage::{BlockStore, MemoryBlockStore};
use chainsync_core::{Block, BlockDifficulty, BlockHeader, BlockIdentifier};
use parking_lot::Mutex;
use std::sync::Arc;

/// Peer that keeps every message sent to it
pub struct RecordingPeer {
    id: PeerId,
    snap_capable: bool,
    sent: Mutex<Vec<SyncMessage>>,
}

impl RecordingPeer {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::from_label(label),
            snap_capable: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn snap(label: &str) -> Arc<Self> {
        Arc::new(Self {
            id: PeerId::from_label(label),
            snap_capable: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SyncMessage> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SyncMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn last_sent(&self) -> Option<SyncMessage> {
        self.sent.lock().last().cloned()
    }
}

impl Peer for RecordingPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, message: SyncMessage) -> Result<(), NetworkError> {
        self.sent.lock().push(message);
        Ok(())
    }

    fn is_snap_capable(&self) -> bool {
        self.snap_capable
    }
}

/// A deterministic chain from genesis
pub struct TestChain {
    blocks: Vec<Block>,
}

impl TestChain {
    pub const DIFFICULTY: BlockDifficulty = BlockDifficulty(10);

    pub fn new(best: u64) -> Self {
        Self {
            blocks: build_chain(best, Self::DIFFICULTY),
        }
    }

    /// Chain sharing blocks `0..=at` with this one, then `extra` blocks of its own
    pub fn fork(&self, at: u64, extra: u64, branch: u64) -> Self {
        let base = self.blocks[..=at as usize].to_vec();
        Self {
            blocks: extend_chain(base, extra, Self::DIFFICULTY, branch),
        }
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn block(&self, number: u64) -> &Block {
        &self.blocks[number as usize]
    }

    pub fn header(&self, number: u64) -> &BlockHeader {
        self.block(number).header()
    }

    pub fn best_number(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn td(&self, number: u64) -> BlockDifficulty {
        self.blocks[..=number as usize]
            .iter()
            .fold(BlockDifficulty::ZERO, |acc, b| acc + b.cumulative_difficulty())
    }

    pub fn status(&self) -> Status {
        let best = self.best_number();
        Status::new(best, self.block(best).hash(), self.td(best))
    }

    /// Store holding blocks `0..=best`
    pub fn store_with(&self, best: u64) -> Arc<MemoryBlockStore> {
        self.store_range(0, best)
    }

    /// Store holding only blocks `min..=max`, with their real total difficulty
    pub fn store_range(&self, min: u64, max: u64) -> Arc<MemoryBlockStore> {
        Arc::new(store_from_chain(&self.blocks, min, max).expect("memory store accepts blocks"))
    }

    /// Store blocks `min..=max` off the canonical index, as a side chain
    pub fn save_side(&self, store: &dyn BlockStore, min: u64, max: u64) {
        for number in min..=max {
            store
                .save(self.block(number), self.td(number), false)
                .expect("memory store accepts blocks");
        }
    }

    /// `count` headers ending at `from`, newest first
    pub fn headers_down(&self, from: u64, count: u64) -> Vec<BlockHeader> {
        (0..count).map(|i| self.header(from - i).clone()).collect()
    }

    pub fn skeleton(&self, numbers: &[u64]) -> Vec<BlockIdentifier> {
        numbers.iter().map(|n| self.header(*n).identifier()).collect()
    }
}

pub fn test_core(config: SyncConfig, store: Arc<dyn BlockStore>, genesis: Block) -> SyncCore {
    SyncCore::new(
        config,
        store,
        genesis,
        Arc::new(PeerScoreBoard::new()),
        SyncValidationRules::default(),
    )
}

/// Register a peer with a status on the core's registry
pub fn connect(core: &mut SyncCore, peer: &Arc<RecordingPeer>, status: Status) {
    use super::events::SyncEventsHandler;
    let now = core.now();
    core.peers_mut().update(peer.clone(), status, now);
}

pub fn transition_name(core: &mut SyncCore) -> Option<&'static str> {
    core.take_transition().map(|state: SyncState| state.name())
}

/// Id of the request last sent to a peer
pub fn last_request_id(peer: &RecordingPeer) -> u64 {
    peer.last_sent()
        .and_then(|m| m.id())
        .expect("a request was sent")
}
