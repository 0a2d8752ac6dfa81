//! Seam between the sync state machine and a snapshot transfer collaborator

use crate::network::message::SnapKind;
use crate::network::peer::PeerId;
use chainsync_core::BlockHeader;

/// How a snapshot transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapOutcome {
    Finished,
    Failed(String),
}

/// What a [`SnapshotProcessor`] can ask of the sync state while it runs.
///
/// Requests queued here are sent by the state through the pending table,
/// so they are correlated and retried like any other request.
#[derive(Debug)]
pub struct SnapSyncHandle {
    peer: PeerId,
    checkpoint: BlockHeader,
    outbox: Vec<(SnapKind, Vec<u8>)>,
    outcome: Option<SnapOutcome>,
}

impl SnapSyncHandle {
    pub fn new(peer: PeerId, checkpoint: BlockHeader) -> Self {
        Self {
            peer,
            checkpoint,
            outbox: Vec::new(),
            outcome: None,
        }
    }

    /// Peer the transfer was started against
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Header the snapshot is anchored to
    pub fn checkpoint(&self) -> &BlockHeader {
        &self.checkpoint
    }

    pub fn submit_request(&mut self, kind: SnapKind, payload: Vec<u8>) {
        self.outbox.push((kind, payload));
    }

    pub fn finish(&mut self) {
        self.outcome = Some(SnapOutcome::Finished);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.outcome = Some(SnapOutcome::Failed(reason.into()));
    }

    pub(crate) fn drain_requests(&mut self) -> Vec<(SnapKind, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn take_outcome(&mut self) -> Option<SnapOutcome> {
        self.outcome.take()
    }
}

/// External snapshot transfer logic. Only the hand-off into and out of the
/// sync state machine is defined here; payload bytes are opaque.
pub trait SnapshotProcessor: Send {
    /// Called once when snapshot sync begins
    fn start(&mut self, handle: &mut SnapSyncHandle);

    /// A correlated response to one of the submitted requests
    fn on_response(&mut self, handle: &mut SnapSyncHandle, peer: &PeerId, kind: SnapKind, payload: Vec<u8>);

    /// A submitted request ran out of retries
    fn on_request_failed(&mut self, handle: &mut SnapSyncHandle, kind: SnapKind) {
        handle.fail(format!("{:?} request exhausted its retries", kind));
    }

    /// Called when the sync state is left, whatever the reason
    fn stop(&mut self);
}
