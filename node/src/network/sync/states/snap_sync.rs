use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::message::{SnapKind, SyncMessage};
use crate::network::peer::PeerId;
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::requests::{PeerSelector, RequestFactory, SweepOutcome, MAX_RETRIES};
use crate::network::sync::scoring::EventType;
use crate::network::sync::snapshot::{SnapOutcome, SnapSyncHandle, SnapshotProcessor};
use chainsync_core::BlockHeader;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Lends the snapshot processor its requests and responses until it
/// reports an outcome.
pub struct SnapSyncState {
    peer: PeerId,
    timer: BaseTimer,
    handle: SnapSyncHandle,
    processor: Option<Box<dyn SnapshotProcessor>>,
    requests: HashMap<u64, SnapKind>,
}

impl SnapSyncState {
    pub fn new(config: &SyncConfig, peer: PeerId, checkpoint: BlockHeader) -> Self {
        // a request may be retried before the state has to step in
        let limit = config.timeout_waiting_request.saturating_mul(MAX_RETRIES + 1);
        Self {
            peer,
            timer: BaseTimer::new(limit),
            handle: SnapSyncHandle::new(peer, checkpoint),
            processor: None,
            requests: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let Some(mut processor) = ctx.take_snapshot_processor() else {
            warn!("Snap sync selected without a snapshot processor");
            ctx.stop_syncing();
            return;
        };
        info!(
            "Snap sync with {} at checkpoint #{}",
            self.peer,
            self.handle.checkpoint().number
        );
        processor.start(&mut self.handle);
        self.processor = Some(processor);
        self.flush(ctx);
    }

    pub fn on_exit(&mut self, ctx: &mut dyn SyncEventsHandler) {
        if let Some(mut processor) = self.processor.take() {
            processor.stop();
            ctx.restore_snapshot_processor(processor);
        }
    }

    fn selector(&self) -> PeerSelector {
        let selected = self.peer;
        Box::new(move |peers, tried, now| {
            if !tried.contains(&selected) && peers.get_peer(&selected).is_some() && !peers.is_excluded(&selected) {
                return Some(selected);
            }
            peers.snap_candidates(now).into_iter().find(|p| !tried.contains(p))
        })
    }

    /// Send what the processor queued, then act on its outcome
    fn flush(&mut self, ctx: &mut dyn SyncEventsHandler) {
        for (kind, payload) in self.handle.drain_requests() {
            let factory: RequestFactory = Box::new(move |id| SyncMessage::SnapRequest {
                id,
                kind,
                payload: payload.clone(),
            });
            match ctx.submit_request(self.selector(), factory) {
                Ok(id) => {
                    trace!("Snap {:?} request #{} submitted", kind, id);
                    self.requests.insert(id, kind);
                }
                Err(e) => {
                    warn!("Could not submit snap {:?} request: {}", kind, e);
                    if let Some(processor) = self.processor.as_mut() {
                        processor.on_request_failed(&mut self.handle, kind);
                    }
                }
            }
        }

        match self.handle.take_outcome() {
            Some(SnapOutcome::Finished) => {
                info!("Snap sync finished");
                ctx.stop_syncing();
            }
            Some(SnapOutcome::Failed(reason)) => {
                ctx.on_error_syncing(&self.peer, EventType::InvalidMessage, &reason);
            }
            None => {}
        }
    }

    pub fn new_snap_response(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        kind: SnapKind,
        payload: Vec<u8>,
    ) {
        if self.requests.remove(&id).is_none() {
            trace!("Ignoring snap response #{} from {}", id, peer);
            return;
        }
        self.timer.reset();
        ctx.peers().record_good_response(peer);
        if let Some(processor) = self.processor.as_mut() {
            processor.on_response(&mut self.handle, peer, kind, payload);
        }
        self.flush(ctx);
    }

    pub fn on_requests_swept(&mut self, ctx: &mut dyn SyncEventsHandler, outcomes: &[SweepOutcome]) {
        for outcome in outcomes {
            match outcome {
                SweepOutcome::Retried { previous_id, id, peer } => {
                    if let Some(kind) = self.requests.remove(previous_id) {
                        debug!("Snap request #{} re-issued as #{} to {}", previous_id, id, peer);
                        self.requests.insert(*id, kind);
                    }
                }
                SweepOutcome::Exhausted { id, peer, .. } => {
                    let Some(kind) = self.requests.remove(id) else {
                        continue;
                    };
                    if let Some(processor) = self.processor.as_mut() {
                        processor.on_request_failed(&mut self.handle, kind);
                    }
                    ctx.on_error_syncing(peer, EventType::TimeoutMessage, "Snap request exhausted its retries");
                    return;
                }
                SweepOutcome::Expired { .. } => {}
            }
        }
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(&self.peer, EventType::TimeoutMessage, "Timeout waiting snapshot data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::Peer;
    use crate::network::sync::test_support::{connect, test_core, transition_name, RecordingPeer, TestChain};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Asks for one chunk and finishes once it arrives
    struct OneChunk {
        stopped: Arc<Mutex<bool>>,
    }

    impl SnapshotProcessor for OneChunk {
        fn start(&mut self, handle: &mut SnapSyncHandle) {
            handle.submit_request(SnapKind::StateChunk, vec![7]);
        }

        fn on_response(&mut self, handle: &mut SnapSyncHandle, _peer: &PeerId, _kind: SnapKind, payload: Vec<u8>) {
            if payload == vec![7] {
                handle.finish();
            } else {
                handle.fail("unexpected chunk");
            }
        }

        fn stop(&mut self) {
            *self.stopped.lock() = true;
        }
    }

    fn setup() -> (crate::network::sync::processor::SyncCore, Arc<RecordingPeer>, SnapSyncState, Arc<Mutex<bool>>) {
        let chain = TestChain::new(500);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), chain.store_with(0), chain.genesis().clone());
        let stopped = Arc::new(Mutex::new(false));
        core.restore_snapshot_processor(Box::new(OneChunk { stopped: stopped.clone() }));
        let peer = RecordingPeer::snap("snap");
        connect(&mut core, &peer, chain.status());
        let state = SnapSyncState::new(&config, peer.id(), chain.header(400).clone());
        (core, peer, state, stopped)
    }

    #[test]
    fn test_finishes_and_returns_processor() {
        let (mut core, peer, mut state, stopped) = setup();
        state.on_enter(&mut core);
        assert!(!core.has_snapshot_processor());

        let Some(SyncMessage::SnapRequest { id, kind, payload }) = peer.last_sent() else {
            panic!("expected a snap request");
        };
        state.new_snap_response(&mut core, &peer.id(), id, kind, payload);
        assert_eq!(transition_name(&mut core), Some("PeerAndModeDeciding"));

        state.on_exit(&mut core);
        assert!(*stopped.lock());
        assert!(core.has_snapshot_processor());
    }

    #[test]
    fn test_exhausted_request_fails_attempt() {
        let (mut core, peer, mut state, _) = setup();
        state.on_enter(&mut core);
        let id = peer.last_sent().and_then(|m| m.id()).unwrap();

        let outcome = SweepOutcome::Exhausted {
            id,
            peer: peer.id(),
            expected: crate::network::message::MessageType::SnapResponse(SnapKind::StateChunk),
        };
        state.on_requests_swept(&mut core, &[outcome]);
        assert_eq!(transition_name(&mut core), Some("PeerAndModeDeciding"));
        assert!(core.peers().last_failure(&peer.id()).is_some());
    }

    #[test]
    fn test_missing_processor_stops() {
        let chain = TestChain::new(500);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), chain.store_with(0), chain.genesis().clone());
        let mut state = SnapSyncState::new(&config, PeerId::from_label("x"), chain.header(400).clone());
        state.on_enter(&mut core);
        assert_eq!(transition_name(&mut core), Some("PeerAndModeDeciding"));
    }
}
