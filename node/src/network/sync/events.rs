//! The operations sync states use to act on the outside world

use super::chunk::ChunkDescriptor;
use super::peers::PeersInformation;
use super::requests::{PeerSelector, RequestFactory};
use super::scoring::EventType;
use super::snapshot::SnapshotProcessor;
use super::validation::SyncValidationRules;
use super::error::SyncError;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::storage::BlockStore;
use chainsync_core::{Block, BlockHeader, BlockIdentifier};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Skeleton received from each peer asked during an attempt
pub type Skeletons = HashMap<PeerId, Vec<BlockIdentifier>>;

/// States never talk to the network or pick their successor themselves:
/// they call this handler, which the sync driver implements.
pub trait SyncEventsHandler {
    fn config(&self) -> &SyncConfig;

    fn block_store(&self) -> Arc<dyn BlockStore>;

    fn validation_rules(&self) -> &SyncValidationRules;

    fn peers(&self) -> &PeersInformation;

    fn peers_mut(&mut self) -> &mut PeersInformation;

    /// Genesis block this node was configured with
    fn genesis(&self) -> &Block;

    /// Reading of the logical clock driven by ticks
    fn now(&self) -> Duration;

    // requests; `None` means nothing was sent

    fn send_block_hash_request(&mut self, peer: &PeerId, height: u64) -> Option<u64>;

    fn send_block_headers_request(&mut self, peer: &PeerId, chunk: ChunkDescriptor) -> Option<u64>;

    fn send_skeleton_request(&mut self, peer: &PeerId, start_number: u64) -> Option<u64>;

    fn send_body_request(&mut self, peer: &PeerId, header: &BlockHeader) -> Option<u64>;

    /// Send a request the pending table re-issues on expiry
    fn submit_request(&mut self, selector: PeerSelector, factory: RequestFactory) -> Result<u64, SyncError>;

    // transitions

    fn start_syncing(&mut self, peer: PeerId);

    fn start_finding_connection_point(&mut self, peer: PeerId);

    /// `connection_point` is the highest block shared with `peer`, by the
    /// hash the peer confirmed
    fn start_downloading_skeleton(&mut self, connection_point: BlockIdentifier, peer: PeerId);

    fn start_downloading_headers(&mut self, skeletons: Skeletons, connection_point: BlockIdentifier, peer: PeerId);

    fn start_downloading_bodies(
        &mut self,
        pending_headers: Vec<VecDeque<BlockHeader>>,
        skeletons: Skeletons,
        peer: PeerId,
    );

    fn backward_syncing(&mut self, peer: PeerId);

    /// `to_request` holds the headers below `child`, newest first
    fn backward_download_bodies(&mut self, child: Block, to_request: Vec<BlockHeader>, peer: PeerId);

    fn start_snap_capable_peer_selection(&mut self);

    fn start_snap_sync(&mut self, peer: PeerId, checkpoint: BlockHeader);

    /// Abandon the attempt and go back to choosing a peer and a mode
    fn stop_syncing(&mut self);

    // errors

    /// Penalise the peer, remember the failure and abandon the attempt
    fn on_error_syncing(&mut self, peer: &PeerId, event: EventType, context: &str);

    /// Penalise the peer without abandoning the attempt
    fn on_sync_issue(&mut self, peer: &PeerId, event: EventType, context: &str);

    // snapshot collaborator, lent to the snapshot state while it runs

    fn take_snapshot_processor(&mut self) -> Option<Box<dyn SnapshotProcessor>>;

    fn restore_snapshot_processor(&mut self, processor: Box<dyn SnapshotProcessor>);

    fn has_snapshot_processor(&self) -> bool;
}
