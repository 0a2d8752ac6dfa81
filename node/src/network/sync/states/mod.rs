//! Sync states. Exactly one is current; the driver feeds it events and
//! swaps it when it asks for a transition.

mod backwards_bodies;
mod backwards_headers;
mod checking_best_header;
mod deciding;
mod downloading_bodies;
mod downloading_headers;
mod downloading_skeleton;
mod finding_connection_point;
mod snap_selection;
mod snap_sync;

pub use backwards_bodies::DownloadingBackwardsBodiesState;
pub use backwards_headers::DownloadingBackwardsHeadersState;
pub use checking_best_header::CheckingBestHeaderState;
pub use deciding::PeerAndModeDecidingState;
pub use downloading_bodies::DownloadingBodiesState;
pub use downloading_headers::DownloadingHeadersState;
pub use downloading_skeleton::{validate_skeleton, DownloadingSkeletonState, SkeletonIssue};
pub use finding_connection_point::FindingConnectionPointState;
pub use snap_selection::{SnapCapablePeerSelectionState, HEADERS_VALIDATION_COUNT};
pub use snap_sync::SnapSyncState;

use super::events::SyncEventsHandler;
use super::requests::SweepOutcome;
use crate::network::message::SyncMessage;
use crate::network::peer::PeerId;
use std::time::Duration;
use tracing::trace;

/// Elapsed-time bookkeeping shared by the states that wait on one peer.
///
/// Fires once when the accumulated time reaches the limit, then starts over.
#[derive(Debug, Clone)]
pub struct BaseTimer {
    elapsed: Duration,
    limit: Duration,
}

impl BaseTimer {
    pub fn new(limit: Duration) -> Self {
        Self {
            elapsed: Duration::ZERO,
            limit,
        }
    }

    /// Advance the timer; `true` means the limit was just reached
    pub fn tick(&mut self, duration: Duration) -> bool {
        self.elapsed = self.elapsed.saturating_add(duration);
        if self.elapsed >= self.limit {
            self.elapsed = Duration::ZERO;
            return true;
        }
        false
    }

    /// A productive message arrived
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

pub enum SyncState {
    PeerAndModeDeciding(PeerAndModeDecidingState),
    CheckingBestHeader(CheckingBestHeaderState),
    FindingConnectionPoint(FindingConnectionPointState),
    DownloadingSkeleton(DownloadingSkeletonState),
    DownloadingHeaders(DownloadingHeadersState),
    DownloadingBodies(DownloadingBodiesState),
    DownloadingBackwardsHeaders(DownloadingBackwardsHeadersState),
    DownloadingBackwardsBodies(DownloadingBackwardsBodiesState),
    SnapCapablePeerSelection(SnapCapablePeerSelectionState),
    SnapSync(SnapSyncState),
}

impl SyncState {
    pub fn name(&self) -> &'static str {
        match self {
            SyncState::PeerAndModeDeciding(_) => "PeerAndModeDeciding",
            SyncState::CheckingBestHeader(_) => "CheckingBestHeader",
            SyncState::FindingConnectionPoint(_) => "FindingConnectionPoint",
            SyncState::DownloadingSkeleton(_) => "DownloadingSkeleton",
            SyncState::DownloadingHeaders(_) => "DownloadingHeaders",
            SyncState::DownloadingBodies(_) => "DownloadingBodies",
            SyncState::DownloadingBackwardsHeaders(_) => "DownloadingBackwardsHeaders",
            SyncState::DownloadingBackwardsBodies(_) => "DownloadingBackwardsBodies",
            SyncState::SnapCapablePeerSelection(_) => "SnapCapablePeerSelection",
            SyncState::SnapSync(_) => "SnapSync",
        }
    }

    pub fn is_syncing(&self) -> bool {
        !matches!(self, SyncState::PeerAndModeDeciding(_))
    }

    /// Peer the current attempt depends on, if any
    pub fn selected_peer(&self) -> Option<&PeerId> {
        match self {
            SyncState::PeerAndModeDeciding(_) | SyncState::SnapCapablePeerSelection(_) => None,
            SyncState::CheckingBestHeader(s) => Some(s.peer()),
            SyncState::FindingConnectionPoint(s) => Some(s.peer()),
            SyncState::DownloadingSkeleton(s) => Some(s.peer()),
            SyncState::DownloadingHeaders(s) => Some(s.peer()),
            SyncState::DownloadingBodies(s) => Some(s.peer()),
            SyncState::DownloadingBackwardsHeaders(s) => Some(s.peer()),
            SyncState::DownloadingBackwardsBodies(s) => Some(s.peer()),
            SyncState::SnapSync(s) => Some(s.peer()),
        }
    }

    /// Runs exactly once, right after the driver installs the state
    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        match self {
            SyncState::PeerAndModeDeciding(s) => s.on_enter(ctx),
            SyncState::CheckingBestHeader(s) => s.on_enter(ctx),
            SyncState::FindingConnectionPoint(s) => s.on_enter(ctx),
            SyncState::DownloadingSkeleton(s) => s.on_enter(ctx),
            SyncState::DownloadingHeaders(s) => s.on_enter(ctx),
            SyncState::DownloadingBodies(s) => s.on_enter(ctx),
            SyncState::DownloadingBackwardsHeaders(s) => s.on_enter(ctx),
            SyncState::DownloadingBackwardsBodies(s) => s.on_enter(ctx),
            SyncState::SnapCapablePeerSelection(s) => s.on_enter(ctx),
            SyncState::SnapSync(s) => s.on_enter(ctx),
        }
    }

    /// Runs exactly once, right before the driver replaces the state
    pub fn on_exit(&mut self, ctx: &mut dyn SyncEventsHandler) {
        match self {
            SyncState::SnapSync(s) => s.on_exit(ctx),
            SyncState::PeerAndModeDeciding(_)
            | SyncState::CheckingBestHeader(_)
            | SyncState::FindingConnectionPoint(_)
            | SyncState::DownloadingSkeleton(_)
            | SyncState::DownloadingHeaders(_)
            | SyncState::DownloadingBodies(_)
            | SyncState::DownloadingBackwardsHeaders(_)
            | SyncState::DownloadingBackwardsBodies(_)
            | SyncState::SnapCapablePeerSelection(_) => {}
        }
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        match self {
            SyncState::PeerAndModeDeciding(s) => s.on_tick(ctx, elapsed),
            SyncState::CheckingBestHeader(s) => s.on_tick(ctx, elapsed),
            SyncState::FindingConnectionPoint(s) => s.on_tick(ctx, elapsed),
            SyncState::DownloadingSkeleton(s) => s.on_tick(ctx, elapsed),
            SyncState::DownloadingHeaders(s) => s.on_tick(ctx, elapsed),
            SyncState::DownloadingBodies(s) => s.on_tick(ctx, elapsed),
            SyncState::DownloadingBackwardsHeaders(s) => s.on_tick(ctx, elapsed),
            SyncState::DownloadingBackwardsBodies(s) => s.on_tick(ctx, elapsed),
            SyncState::SnapCapablePeerSelection(s) => s.on_tick(ctx, elapsed),
            SyncState::SnapSync(s) => s.on_tick(ctx, elapsed),
        }
    }

    /// A peer announced a new status; only the deciding state reacts
    pub fn on_peer_status(&mut self, ctx: &mut dyn SyncEventsHandler) {
        match self {
            SyncState::PeerAndModeDeciding(s) => s.on_peer_status(ctx),
            SyncState::CheckingBestHeader(_)
            | SyncState::FindingConnectionPoint(_)
            | SyncState::DownloadingSkeleton(_)
            | SyncState::DownloadingHeaders(_)
            | SyncState::DownloadingBodies(_)
            | SyncState::DownloadingBackwardsHeaders(_)
            | SyncState::DownloadingBackwardsBodies(_)
            | SyncState::SnapCapablePeerSelection(_)
            | SyncState::SnapSync(_) => {}
        }
    }

    /// A correlated response from `peer`
    pub fn on_message(&mut self, ctx: &mut dyn SyncEventsHandler, peer: &PeerId, message: SyncMessage) {
        match (self, message) {
            (SyncState::CheckingBestHeader(s), SyncMessage::BlockHeadersResponse { id, headers }) => {
                s.new_block_headers(ctx, peer, id, headers)
            }
            (SyncState::DownloadingHeaders(s), SyncMessage::BlockHeadersResponse { id, headers }) => {
                s.new_block_headers(ctx, peer, id, headers)
            }
            (SyncState::DownloadingBackwardsHeaders(s), SyncMessage::BlockHeadersResponse { id, headers }) => {
                s.new_block_headers(ctx, peer, id, headers)
            }
            (SyncState::SnapCapablePeerSelection(s), SyncMessage::BlockHeadersResponse { id, headers }) => {
                s.new_block_headers(ctx, peer, id, headers)
            }
            (SyncState::FindingConnectionPoint(s), SyncMessage::BlockHashResponse { id, hash }) => {
                s.new_connection_point_data(ctx, peer, id, hash)
            }
            (SyncState::SnapCapablePeerSelection(s), SyncMessage::BlockHashResponse { id, hash }) => {
                s.new_block_hash(ctx, peer, id, hash)
            }
            (SyncState::DownloadingSkeleton(s), SyncMessage::SkeletonResponse { id, block_identifiers }) => {
                s.new_skeleton(ctx, peer, id, block_identifiers)
            }
            (SyncState::DownloadingBodies(s), SyncMessage::BodyResponse { id, body }) => s.new_body(ctx, peer, id, body),
            (SyncState::DownloadingBackwardsBodies(s), SyncMessage::BodyResponse { id, body }) => {
                s.new_body(ctx, peer, id, body)
            }
            (SyncState::SnapSync(s), SyncMessage::SnapResponse { id, kind, payload }) => {
                s.new_snap_response(ctx, peer, id, kind, payload)
            }
            (state, message) => {
                trace!("{} ignores {} from {}", state.name(), message.message_type(), peer);
            }
        }
    }

    /// Expired requests were re-issued or given up by the pending table
    pub fn on_requests_swept(&mut self, ctx: &mut dyn SyncEventsHandler, outcomes: &[SweepOutcome]) {
        match self {
            SyncState::SnapSync(s) => s.on_requests_swept(ctx, outcomes),
            SyncState::PeerAndModeDeciding(_)
            | SyncState::CheckingBestHeader(_)
            | SyncState::FindingConnectionPoint(_)
            | SyncState::DownloadingSkeleton(_)
            | SyncState::DownloadingHeaders(_)
            | SyncState::DownloadingBodies(_)
            | SyncState::DownloadingBackwardsHeaders(_)
            | SyncState::DownloadingBackwardsBodies(_)
            | SyncState::SnapCapablePeerSelection(_) => {}
        }
    }
}
