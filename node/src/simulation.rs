//! In-process chains and peers for exercising sync without a transport
//!
//! [`Simulation`] drives a [`SyncProcessor`] synchronously against
//! [`SimulatedPeer`]s, which answer from their own block store. It is what
//! the integration tests use. [`sync_over_service`] does the same through
//! the async [`SyncService`] and a channel-backed peer, which is what the
//! `simulate` command runs.

use crate::config::SyncConfig;
use crate::network::message::{MessageType, SnapKind, Status, SyncMessage};
use crate::network::peer::{ChannelPeer, NetworkCommand, NetworkError, Peer, PeerId, PeerRef};
use crate::network::responder::ChainResponder;
use crate::network::sync::{
    PeerScoreBoard, SnapSyncHandle, SnapshotProcessor, SyncError, SyncHandle, SyncProcessor, SyncService,
    SyncStats, SyncValidationRules,
};
use crate::storage::{BlockStore, MemoryBlockStore, StorageError};
use chainsync_core::{Block, BlockBody, BlockDifficulty, Transaction};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
pub const BLOCK_INTERVAL_SECS: u64 = 10;

/// Upper bound on message deliveries in one [`Simulation::pump`]
const MAX_DELIVERIES_PER_PUMP: usize = 1_000_000;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Source chain has no best block")]
    EmptySource,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Sync did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Sync service failed: {0}")]
    ServiceFailed(String),
}

/// Genesis plus `length` blocks of constant difficulty
pub fn build_chain(length: u64, difficulty: BlockDifficulty) -> Vec<Block> {
    let genesis = Block::genesis(difficulty, GENESIS_TIMESTAMP);
    extend_chain(vec![genesis], length, difficulty, 0)
}

/// Append `extra` blocks on top of `blocks`. `branch` goes into every new
/// block so forks built from the same base never share hashes.
pub fn extend_chain(mut blocks: Vec<Block>, extra: u64, difficulty: BlockDifficulty, branch: u64) -> Vec<Block> {
    if blocks.is_empty() {
        blocks.push(Block::genesis(difficulty, GENESIS_TIMESTAMP));
    }
    blocks.reserve(extra as usize);
    for _ in 0..extra {
        let Some(parent) = blocks.last() else {
            break;
        };
        let number = parent.number() + 1;
        let payload = format!("branch-{}-block-{}", branch, number).into_bytes();
        let body = BlockBody::new(vec![Transaction::new(payload)], Vec::new());
        let timestamp = parent.header().timestamp + BLOCK_INTERVAL_SECS;
        let block = Block::child_of(parent.header(), body, difficulty, timestamp, branch);
        blocks.push(block);
    }
    blocks
}

/// Store holding `blocks[min..=max]` as its canonical chain, each saved with
/// the total difficulty it has on the full chain
pub fn store_from_chain(blocks: &[Block], min: u64, max: u64) -> Result<MemoryBlockStore, StorageError> {
    let store = MemoryBlockStore::new();
    let mut total = BlockDifficulty::ZERO;
    for block in blocks {
        total = total
            .checked_add(block.cumulative_difficulty())
            .map_err(|e| StorageError::InvalidBlock(e.to_string()))?;
        if (min..=max).contains(&block.number()) {
            store.save(block, total, true)?;
        }
    }
    Ok(store)
}

/// Rewrites or drops a peer's answer before it is delivered
pub type ResponseFilter = Box<dyn Fn(SyncMessage) -> Option<SyncMessage> + Send + Sync>;

/// Peer answering from its own chain once [`SimulatedPeer::answer_pending`]
/// is called
pub struct SimulatedPeer {
    id: PeerId,
    responder: ChainResponder,
    snap_capable: bool,
    filter: Option<ResponseFilter>,
    muted: AtomicBool,
    inbox: Mutex<VecDeque<SyncMessage>>,
    requests: Mutex<HashMap<MessageType, usize>>,
}

impl SimulatedPeer {
    pub fn new(label: &str, store: Arc<dyn BlockStore>, chunk_size: u32) -> Self {
        Self {
            id: PeerId::from_label(label),
            responder: ChainResponder::new(store, chunk_size),
            snap_capable: false,
            filter: None,
            muted: AtomicBool::new(false),
            inbox: Mutex::new(VecDeque::new()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Peer serving the whole of `blocks`
    pub fn from_chain(label: &str, blocks: &[Block], chunk_size: u32) -> Result<Self, SimulationError> {
        let best = blocks.last().map(|b| b.number()).ok_or(SimulationError::EmptySource)?;
        let store = store_from_chain(blocks, 0, best)?;
        Ok(Self::new(label, Arc::new(store), chunk_size))
    }

    pub fn with_snap_capability(mut self) -> Self {
        self.snap_capable = true;
        self
    }

    /// Pass every answer through `filter`, for peers that misbehave
    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(SyncMessage) -> Option<SyncMessage> + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn status(&self) -> Option<Status> {
        self.responder.status()
    }

    /// A muted peer swallows requests without answering
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn requests_of(&self, message_type: MessageType) -> usize {
        self.requests.lock().get(&message_type).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().values().sum()
    }

    /// Drain the inbox and build the answers
    pub fn answer_pending(&self) -> Vec<SyncMessage> {
        let requests: Vec<SyncMessage> = self.inbox.lock().drain(..).collect();
        if self.muted.load(Ordering::Relaxed) {
            trace!("{} muted, dropping {} requests", self.id, requests.len());
            return Vec::new();
        }
        requests
            .iter()
            .filter_map(|request| match request {
                SyncMessage::SnapRequest { id, kind, payload } if self.snap_capable => {
                    Some(SyncMessage::SnapResponse {
                        id: *id,
                        kind: *kind,
                        payload: payload.clone(),
                    })
                }
                other => self.responder.respond(other),
            })
            .filter_map(|response| match &self.filter {
                Some(filter) => filter(response),
                None => Some(response),
            })
            .collect()
    }
}

impl Peer for SimulatedPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, message: SyncMessage) -> Result<(), NetworkError> {
        *self.requests.lock().entry(message.message_type()).or_insert(0) += 1;
        self.inbox.lock().push_back(message);
        Ok(())
    }

    fn is_snap_capable(&self) -> bool {
        self.snap_capable
    }
}

/// Synchronous harness: delivers every answer before the clock moves
pub struct Simulation {
    processor: SyncProcessor,
    peers: Vec<Arc<SimulatedPeer>>,
    tick: Duration,
}

impl Simulation {
    pub fn new(processor: SyncProcessor, tick: Duration) -> Self {
        Self {
            processor,
            peers: Vec::new(),
            tick,
        }
    }

    /// Connect a peer and deliver its status
    pub fn add_peer(&mut self, peer: Arc<SimulatedPeer>) {
        self.peers.push(Arc::clone(&peer));
        self.announce(&peer);
    }

    /// Deliver the peer's current status again
    pub fn announce(&mut self, peer: &Arc<SimulatedPeer>) {
        if let Some(status) = peer.status() {
            let peer_ref: PeerRef = peer.clone();
            self.processor.on_peer_status(peer_ref, status);
        }
    }

    pub fn disconnect(&mut self, peer: &PeerId) {
        self.peers.retain(|p| p.id() != *peer);
        self.processor.on_peer_disconnected(peer);
    }

    /// Deliver whatever every peer has answered so far, without letting
    /// the requests this triggers be answered too. Returns the number of
    /// messages delivered.
    pub fn deliver_once(&mut self) -> usize {
        let mut delivered = 0;
        for peer in self.peers.clone() {
            for response in peer.answer_pending() {
                let peer_ref: PeerRef = peer.clone();
                self.processor.on_message(peer_ref, response);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver answers until no peer has anything left to say. Returns the
    /// number of messages delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let round = self.deliver_once();
            delivered += round;
            if round == 0 || delivered >= MAX_DELIVERIES_PER_PUMP {
                return delivered;
            }
        }
    }

    pub fn tick(&mut self) {
        self.processor.on_tick(self.tick);
    }

    /// Pump and tick until `done` holds or `max_ticks` ticks have passed
    pub fn run_until<F>(&mut self, max_ticks: usize, mut done: F) -> bool
    where
        F: FnMut(&SyncProcessor) -> bool,
    {
        for _ in 0..max_ticks {
            self.pump();
            if done(&self.processor) {
                return true;
            }
            self.tick();
        }
        self.pump();
        done(&self.processor)
    }

    pub fn processor(&self) -> &SyncProcessor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut SyncProcessor {
        &mut self.processor
    }

    pub fn into_processor(self) -> SyncProcessor {
        self.processor
    }
}

/// Snapshot transfer of `chunks` numbered state chunks, fetched one at a
/// time. Each answer must echo the index it was asked for.
#[derive(Debug, Default)]
pub struct ChunkedSnapshot {
    chunks: u32,
    next: u32,
    running: bool,
}

impl ChunkedSnapshot {
    pub fn new(chunks: u32) -> Self {
        Self {
            chunks,
            next: 0,
            running: false,
        }
    }

    pub fn received(&self) -> u32 {
        self.next
    }

    fn request_next(&self, handle: &mut SnapSyncHandle) {
        handle.submit_request(SnapKind::StateChunk, self.next.to_be_bytes().to_vec());
    }
}

impl SnapshotProcessor for ChunkedSnapshot {
    fn start(&mut self, handle: &mut SnapSyncHandle) {
        self.running = true;
        self.next = 0;
        if self.chunks == 0 {
            handle.finish();
            return;
        }
        self.request_next(handle);
    }

    fn on_response(&mut self, handle: &mut SnapSyncHandle, peer: &PeerId, kind: SnapKind, payload: Vec<u8>) {
        if !self.running {
            return;
        }
        if kind != SnapKind::StateChunk || payload != self.next.to_be_bytes() {
            handle.fail(format!("Unexpected snapshot chunk from {}", peer));
            return;
        }
        self.next += 1;
        debug!("Snapshot chunk {}/{} from {}", self.next, self.chunks, peer);
        if self.next == self.chunks {
            handle.finish();
        } else {
            self.request_next(handle);
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Sync a fresh node holding only `genesis` from `source` through a spawned
/// [`SyncService`]. Requests reach the source through a [`ChannelPeer`];
/// answers come back through the service handle.
pub async fn sync_over_service(
    mut config: SyncConfig,
    source: Arc<dyn BlockStore>,
    genesis: Block,
    deadline: Duration,
) -> Result<SyncStats, SimulationError> {
    // a single source peer, no point waiting for more
    config.expected_peers = 1;

    let responder = ChainResponder::new(source, config.chunk_size);
    let status = responder.status().ok_or(SimulationError::EmptySource)?;
    let target = status.best_block_number;

    let local: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::with_genesis(&genesis));
    let processor = SyncProcessor::new(
        config.clone(),
        local,
        genesis,
        Arc::new(PeerScoreBoard::new()),
        SyncValidationRules::default(),
    );
    let (service, handle) = SyncService::new(processor, config.tick_interval());
    let task = service.spawn();

    let (commands_tx, mut commands) = mpsc::channel(config.max_pending_requests.max(1));
    let peer: PeerRef = Arc::new(ChannelPeer::new(PeerId::from_label("source"), commands_tx));
    info!("Syncing {} blocks from {}", target, peer.id());
    handle.peer_status(Arc::clone(&peer), status).await?;

    let transfer = serve_source(&mut commands, &responder, &handle, &peer, target, config.tick_interval());
    let result = match tokio::time::timeout(deadline, transfer).await {
        Ok(result) => result,
        Err(_) => Err(SimulationError::TimedOut(deadline)),
    };

    handle.shutdown().await?;
    task.await.map_err(|e| SimulationError::ServiceFailed(e.to_string()))?;
    result
}

/// Answer everything the service asks of the source until the local chain
/// reaches `target` and sync has settled
async fn serve_source(
    commands: &mut mpsc::Receiver<NetworkCommand>,
    responder: &ChainResponder,
    handle: &SyncHandle,
    peer: &PeerRef,
    target: u64,
    poll_interval: Duration,
) -> Result<SyncStats, SimulationError> {
    let mut poll = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(NetworkCommand::SendToPeer { message, .. }) => {
                    if let Some(response) = responder.respond(&message) {
                        handle.message(Arc::clone(peer), response).await?;
                    }
                }
                Some(NetworkCommand::DisconnectPeer(id)) => debug!("Ignoring disconnect of {}", id),
                None => return Err(SimulationError::ServiceFailed("peer channel closed".into())),
            },
            _ = poll.tick() => {
                let stats = handle.stats().await?;
                if !stats.syncing && stats.best_block_number >= target {
                    return Ok(stats);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chain_links_blocks() {
        let blocks = build_chain(5, BlockDifficulty(3));
        assert_eq!(blocks.len(), 6);
        for pair in blocks.windows(2) {
            assert!(pair[0].is_parent_of(&pair[1]));
            assert!(pair[1].header().timestamp > pair[0].header().timestamp);
        }
    }

    #[test]
    fn test_forks_do_not_share_hashes() {
        let base = build_chain(3, BlockDifficulty(1));
        let a = extend_chain(base.clone(), 2, BlockDifficulty(1), 1);
        let b = extend_chain(base, 2, BlockDifficulty(1), 2);
        assert_eq!(a[3].hash(), b[3].hash());
        assert_ne!(a[4].hash(), b[4].hash());
    }

    #[test]
    fn test_store_range_keeps_real_difficulty() {
        let blocks = build_chain(10, BlockDifficulty(2));
        let store = store_from_chain(&blocks, 5, 8).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.min_number(), 5);
        assert_eq!(store.best_number(), 8);
        assert_eq!(store.best_total_difficulty(), BlockDifficulty(18));
    }

    #[test]
    fn test_muted_peer_answers_nothing() {
        let peer = SimulatedPeer::from_chain("m", &build_chain(3, BlockDifficulty(1)), 192).unwrap();
        peer.set_muted(true);
        peer.send(SyncMessage::BlockHashRequest { id: 1, height: 1 }).unwrap();
        assert!(peer.answer_pending().is_empty());
        assert_eq!(peer.requests_of(MessageType::BlockHashRequest), 1);
    }

    #[test]
    fn test_snap_requests_are_echoed_by_capable_peers() {
        let blocks = build_chain(3, BlockDifficulty(1));
        let plain = SimulatedPeer::from_chain("p", &blocks, 192).unwrap();
        let snap = SimulatedPeer::from_chain("s", &blocks, 192).unwrap().with_snap_capability();
        let request = SyncMessage::SnapRequest {
            id: 9,
            kind: SnapKind::StateChunk,
            payload: vec![1, 2],
        };
        plain.send(request.clone()).unwrap();
        snap.send(request).unwrap();
        assert!(plain.answer_pending().is_empty());
        assert_eq!(
            snap.answer_pending(),
            vec![SyncMessage::SnapResponse {
                id: 9,
                kind: SnapKind::StateChunk,
                payload: vec![1, 2]
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_over_service_reaches_source_height() {
        let blocks = build_chain(300, BlockDifficulty(10));
        let source: Arc<dyn BlockStore> = Arc::new(store_from_chain(&blocks, 0, 300).unwrap());
        let stats = sync_over_service(
            SyncConfig::immediate_for_testing(),
            source,
            blocks[0].clone(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_eq!(stats.best_block_number, 300);
        assert!(!stats.syncing);
    }
}
