//! The sync driver: owns the current state and everything states act on

use super::chunk::ChunkDescriptor;
use super::error::SyncError;
use super::events::{Skeletons, SyncEventsHandler};
use super::peers::PeersInformation;
use super::requests::{PeerSelector, PendingRequests, RequestFactory};
use super::scoring::{EventType, ScoringSink};
use super::snapshot::SnapshotProcessor;
use super::states::{
    CheckingBestHeaderState, DownloadingBackwardsBodiesState, DownloadingBackwardsHeadersState,
    DownloadingBodiesState, DownloadingHeadersState, DownloadingSkeletonState, FindingConnectionPointState,
    PeerAndModeDecidingState, SnapCapablePeerSelectionState, SnapSyncState, SyncState,
};
use super::validation::SyncValidationRules;
use crate::config::SyncConfig;
use crate::network::message::{Status, SyncMessage};
use crate::network::peer::{PeerId, PeerRef};
use crate::storage::BlockStore;
use chainsync_core::{Block, BlockDifficulty, BlockHeader, BlockIdentifier};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Transitions requested from inside `on_enter` chain at most this deep
const MAX_CHAINED_TRANSITIONS: usize = 16;

/// Point-in-time view of the sync component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub state: &'static str,
    pub syncing: bool,
    pub best_block_number: u64,
    pub total_difficulty: BlockDifficulty,
    pub known_peers: usize,
    pub pending_requests: usize,
    pub last_request_id: u64,
}

/// Everything the states operate on. The current state itself lives in
/// [`SyncProcessor`], so a state can borrow this mutably while it runs.
pub struct SyncCore {
    config: SyncConfig,
    store: Arc<dyn BlockStore>,
    rules: SyncValidationRules,
    genesis: Block,
    peers: PeersInformation,
    pending: PendingRequests,
    snapshot_processor: Option<Box<dyn SnapshotProcessor>>,
    now: Duration,
    transition: Option<SyncState>,
}

impl SyncCore {
    pub(crate) fn new(
        config: SyncConfig,
        store: Arc<dyn BlockStore>,
        genesis: Block,
        scoring: Arc<dyn ScoringSink>,
        rules: SyncValidationRules,
    ) -> Self {
        let peers = PeersInformation::new(&config, Arc::clone(&store), scoring);
        let pending = PendingRequests::new(config.timeout_waiting_request, config.max_pending_requests);
        Self {
            config,
            store,
            rules,
            genesis,
            peers,
            pending,
            snapshot_processor: None,
            now: Duration::ZERO,
            transition: None,
        }
    }

    pub(crate) fn take_transition(&mut self) -> Option<SyncState> {
        self.transition.take()
    }

    fn transition_to(&mut self, state: SyncState) {
        if let Some(previous) = &self.transition {
            debug!("Transition to {} replaces {}", state.name(), previous.name());
        }
        self.transition = Some(state);
    }

    fn send<F>(&mut self, peer: &PeerId, build: F) -> Option<u64>
    where
        F: FnOnce(u64) -> SyncMessage,
    {
        match self.pending.send(&self.peers, peer, build, self.now) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to send request to {}: {}", peer, e);
                None
            }
        }
    }
}

impl SyncEventsHandler for SyncCore {
    fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn block_store(&self) -> Arc<dyn BlockStore> {
        Arc::clone(&self.store)
    }

    fn validation_rules(&self) -> &SyncValidationRules {
        &self.rules
    }

    fn peers(&self) -> &PeersInformation {
        &self.peers
    }

    fn peers_mut(&mut self) -> &mut PeersInformation {
        &mut self.peers
    }

    fn genesis(&self) -> &Block {
        &self.genesis
    }

    fn now(&self) -> Duration {
        self.now
    }

    fn send_block_hash_request(&mut self, peer: &PeerId, height: u64) -> Option<u64> {
        self.send(peer, |id| SyncMessage::BlockHashRequest { id, height })
    }

    fn send_block_headers_request(&mut self, peer: &PeerId, chunk: ChunkDescriptor) -> Option<u64> {
        self.send(peer, |id| SyncMessage::BlockHeadersRequest {
            id,
            hash: *chunk.hash(),
            count: chunk.count(),
        })
    }

    fn send_skeleton_request(&mut self, peer: &PeerId, start_number: u64) -> Option<u64> {
        self.send(peer, |id| SyncMessage::SkeletonRequest { id, start_number })
    }

    fn send_body_request(&mut self, peer: &PeerId, header: &BlockHeader) -> Option<u64> {
        let hash = header.hash();
        self.send(peer, |id| SyncMessage::BodyRequest { id, hash })
    }

    fn submit_request(&mut self, selector: PeerSelector, factory: RequestFactory) -> Result<u64, SyncError> {
        self.pending.submit(&self.peers, selector, factory, self.now)
    }

    fn start_syncing(&mut self, peer: PeerId) {
        let state = CheckingBestHeaderState::new(&self.config, peer);
        self.transition_to(SyncState::CheckingBestHeader(state));
    }

    fn start_finding_connection_point(&mut self, peer: PeerId) {
        let Some(best) = self.peers.status_of(&peer).map(|s| s.best_block_number) else {
            warn!("Lost the status of {}", peer);
            self.stop_syncing();
            return;
        };
        let state = FindingConnectionPointState::new(&self.config, peer, best);
        self.transition_to(SyncState::FindingConnectionPoint(state));
    }

    fn start_downloading_skeleton(&mut self, connection_point: BlockIdentifier, peer: PeerId) {
        let state = DownloadingSkeletonState::new(&self.config, connection_point, peer);
        self.transition_to(SyncState::DownloadingSkeleton(state));
    }

    fn start_downloading_headers(&mut self, skeletons: Skeletons, connection_point: BlockIdentifier, peer: PeerId) {
        let state = DownloadingHeadersState::new(&self.config, skeletons, connection_point, peer);
        self.transition_to(SyncState::DownloadingHeaders(state));
    }

    fn start_downloading_bodies(
        &mut self,
        pending_headers: Vec<VecDeque<BlockHeader>>,
        skeletons: Skeletons,
        peer: PeerId,
    ) {
        let state = DownloadingBodiesState::new(&self.config, pending_headers, skeletons, peer);
        self.transition_to(SyncState::DownloadingBodies(state));
    }

    fn backward_syncing(&mut self, peer: PeerId) {
        let state = DownloadingBackwardsHeadersState::new(&self.config, peer);
        self.transition_to(SyncState::DownloadingBackwardsHeaders(state));
    }

    fn backward_download_bodies(&mut self, child: Block, to_request: Vec<BlockHeader>, peer: PeerId) {
        let state = DownloadingBackwardsBodiesState::new(&self.config, child, to_request, peer);
        self.transition_to(SyncState::DownloadingBackwardsBodies(state));
    }

    fn start_snap_capable_peer_selection(&mut self) {
        let state = SnapCapablePeerSelectionState::new(&self.config);
        self.transition_to(SyncState::SnapCapablePeerSelection(state));
    }

    fn start_snap_sync(&mut self, peer: PeerId, checkpoint: BlockHeader) {
        let state = SnapSyncState::new(&self.config, peer, checkpoint);
        self.transition_to(SyncState::SnapSync(state));
    }

    fn stop_syncing(&mut self) {
        self.transition_to(SyncState::PeerAndModeDeciding(PeerAndModeDecidingState::new()));
    }

    fn on_error_syncing(&mut self, peer: &PeerId, event: EventType, context: &str) {
        self.peers.process_syncing_error(peer, event, context, self.now);
        self.stop_syncing();
    }

    fn on_sync_issue(&mut self, peer: &PeerId, event: EventType, context: &str) {
        self.peers.report_event(peer, event, context);
    }

    fn take_snapshot_processor(&mut self) -> Option<Box<dyn SnapshotProcessor>> {
        self.snapshot_processor.take()
    }

    fn restore_snapshot_processor(&mut self, processor: Box<dyn SnapshotProcessor>) {
        self.snapshot_processor = Some(processor);
    }

    fn has_snapshot_processor(&self) -> bool {
        self.snapshot_processor.is_some()
    }
}

/// Single-threaded sync state machine. Every entry point runs to
/// completion, then applies whatever transition the state asked for.
pub struct SyncProcessor {
    core: SyncCore,
    state: SyncState,
}

impl SyncProcessor {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn BlockStore>,
        genesis: Block,
        scoring: Arc<dyn ScoringSink>,
        rules: SyncValidationRules,
    ) -> Self {
        let mut core = SyncCore::new(config, store, genesis, scoring, rules);
        let mut state = SyncState::PeerAndModeDeciding(PeerAndModeDecidingState::new());
        state.on_enter(&mut core);
        let mut processor = Self { core, state };
        processor.apply_transitions();
        processor
    }

    pub fn with_snapshot_processor(mut self, processor: Box<dyn SnapshotProcessor>) -> Self {
        self.core.snapshot_processor = Some(processor);
        self
    }

    /// A peer announced its chain
    pub fn on_peer_status(&mut self, peer: PeerRef, status: Status) {
        trace!(
            "Status from {}: best #{} td={}",
            peer.id(),
            status.best_block_number,
            status.total_difficulty
        );
        let now = self.core.now;
        self.core.peers.update(peer, status, now);
        self.state.on_peer_status(&mut self.core);
        self.apply_transitions();
    }

    /// A message from a peer. Responses are matched against the pending
    /// table before the current state sees them.
    pub fn on_message(&mut self, peer: PeerRef, message: SyncMessage) {
        let peer_id = peer.id();
        if let SyncMessage::Status(status) = message {
            self.on_peer_status(peer, status);
            return;
        }
        if !message.message_type().is_response() {
            trace!("Ignoring {} from {}", message.message_type(), peer_id);
            return;
        }

        self.core.peers.touch(&peer_id, self.core.now);
        match self.core.pending.on_response(&peer_id, &message) {
            Ok(request) => {
                trace!("Response to request #{} from {}", request.id, peer_id);
                self.state.on_message(&mut self.core, &peer_id, message);
                self.apply_transitions();
            }
            Err(rejection) => {
                let context = format!("Unexpected {}: {}", message.message_type(), rejection);
                self.core
                    .peers
                    .report_event(&peer_id, EventType::UnexpectedMessage, &context);
            }
        }
    }

    /// Advance the logical clock
    pub fn on_tick(&mut self, elapsed: Duration) {
        self.core.now = self.core.now.saturating_add(elapsed);

        let outcomes = self.core.pending.sweep_expired(&self.core.peers, self.core.now);
        if !outcomes.is_empty() {
            self.state.on_requests_swept(&mut self.core, &outcomes);
            self.apply_transitions();
        }

        self.core.peers.clear_old_failed_peers(self.core.now);
        self.state.on_tick(&mut self.core, elapsed);
        self.apply_transitions();
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        self.core.peers.disconnect(peer);
        if self.state.selected_peer() == Some(peer) {
            info!("Sync peer {} disconnected, abandoning attempt", peer);
            self.core.stop_syncing();
            self.apply_transitions();
        }
    }

    /// Abandon the running attempt without penalising anyone
    pub fn abort_sync(&mut self) {
        if self.state.is_syncing() {
            info!("Aborting sync in {}", self.state.name());
            self.core.stop_syncing();
            self.apply_transitions();
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.state.is_syncing()
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn peers(&self) -> &PeersInformation {
        &self.core.peers
    }

    pub fn block_store(&self) -> Arc<dyn BlockStore> {
        Arc::clone(&self.core.store)
    }

    pub fn now(&self) -> Duration {
        self.core.now
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            state: self.state.name(),
            syncing: self.state.is_syncing(),
            best_block_number: self.core.store.best_number(),
            total_difficulty: self.core.store.best_total_difficulty(),
            known_peers: self.core.peers.known_peers(),
            pending_requests: self.core.pending.len(),
            last_request_id: self.core.pending.last_id(),
        }
    }

    fn apply_transitions(&mut self) {
        for _ in 0..MAX_CHAINED_TRANSITIONS {
            let Some(next) = self.core.transition.take() else {
                return;
            };

            self.state.on_exit(&mut self.core);
            // exit hooks cannot redirect the transition
            self.core.transition = None;
            self.core.pending.clear_retryable();

            let previous = std::mem::replace(&mut self.state, next);
            info!("Sync state {} -> {}", previous.name(), self.state.name());
            self.state.on_enter(&mut self.core);
        }
        self.drop_runaway_transition();
    }

    /// Discard a transition still queued once the chain limit is spent.
    /// A chain that ends exactly at the limit leaves nothing behind.
    fn drop_runaway_transition(&mut self) -> bool {
        let Some(next) = self.core.transition.take() else {
            return false;
        };
        warn!(
            "Stopped after {} chained sync state transitions, staying in {} instead of {}",
            MAX_CHAINED_TRANSITIONS,
            self.state.name(),
            next.name()
        );
        true
    }
}
