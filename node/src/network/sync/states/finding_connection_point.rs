use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::connection_point::{ConnectionPoint, ConnectionPointFinder};
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::scoring::EventType;
use chainsync_core::hash::short_hex;
use chainsync_core::{BlockIdentifier, Hash256};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Binary search for the highest block shared with the selected peer
pub struct FindingConnectionPointState {
    peer: PeerId,
    finder: ConnectionPointFinder,
    timer: BaseTimer,
    request_id: Option<u64>,
    /// Last block the peer confirmed sharing; the window's lower bound
    shared: Option<BlockIdentifier>,
}

impl FindingConnectionPointState {
    pub fn new(config: &SyncConfig, peer: PeerId, peer_best_number: u64) -> Self {
        Self {
            peer,
            finder: ConnectionPointFinder::new(peer_best_number),
            timer: BaseTimer::new(config.timeout_waiting_request),
            request_id: None,
            shared: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        self.try_send_request(ctx);
    }

    pub fn new_connection_point_data(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        hash: Hash256,
    ) {
        if self.request_id != Some(id) {
            trace!("Ignoring block hash #{} from {}", id, peer);
            return;
        }
        self.request_id = None;
        self.timer.reset();

        let height = self.finder.current_height();
        if ctx.block_store().contains(&hash) {
            debug!("Block #{} {} is shared with {}", height, short_hex(&hash), peer);
            self.shared = Some(BlockIdentifier::new(height, hash));
            self.finder.found();
        } else {
            debug!("Block #{} {} is unknown locally", height, short_hex(&hash));
            self.finder.not_found();
        }
        self.try_send_request(ctx);
    }

    fn try_send_request(&mut self, ctx: &mut dyn SyncEventsHandler) {
        match self.finder.connection_point() {
            ConnectionPoint::Found(height) => {
                // nothing confirmed means the window never left genesis
                let shared = match self.shared {
                    Some(shared) if shared.number == height => shared,
                    _ => ctx.genesis().header().identifier(),
                };
                info!("Connection point with {} found at {}", self.peer, shared);
                ctx.start_downloading_skeleton(shared, self.peer);
            }
            ConnectionPoint::NotFound => {
                let height = self.finder.current_height();
                self.request_id = ctx.send_block_hash_request(&self.peer, height);
                if self.request_id.is_none() {
                    ctx.stop_syncing();
                }
            }
        }
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(
                &self.peer,
                EventType::TimeoutMessage,
                "Timeout waiting connection point data",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::SyncMessage;
    use crate::network::peer::Peer;
    use crate::network::sync::states::SyncState;
    use crate::network::sync::test_support::{
        connect, last_request_id, test_core, transition_name, RecordingPeer, TestChain,
    };

    /// Answer every hash request from `remote` until the state settles
    fn drive(
        state: &mut FindingConnectionPointState,
        core: &mut crate::network::sync::processor::SyncCore,
        peer: &RecordingPeer,
        remote: &TestChain,
    ) -> u32 {
        let mut rounds = 0;
        while let Some(SyncMessage::BlockHashRequest { id, height }) = peer.take_sent().pop() {
            rounds += 1;
            state.new_connection_point_data(core, &peer.id(), id, remote.block(height).hash());
        }
        rounds
    }

    #[test]
    fn test_fresh_node_connects_at_genesis() {
        let remote = TestChain::new(1000);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), remote.store_with(0), remote.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, remote.status());

        let mut state = FindingConnectionPointState::new(&config, peer.id(), 1000);
        state.on_enter(&mut core);
        let rounds = drive(&mut state, &mut core, &peer, &remote);

        assert!(rounds <= 10);
        assert_eq!(transition_name(&mut core), Some("DownloadingSkeleton"));
    }

    #[test]
    fn test_finds_fork_height() {
        let local = TestChain::new(300);
        let remote = local.fork(137, 400, 1);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), local.store_with(300), local.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, remote.status());

        let mut state = FindingConnectionPointState::new(&config, peer.id(), remote.best_number());
        state.on_enter(&mut core);
        drive(&mut state, &mut core, &peer, &remote);

        assert_eq!(state.finder.connection_point(), ConnectionPoint::Found(137));
    }

    #[test]
    fn test_stale_answer_is_ignored() {
        let remote = TestChain::new(100);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), remote.store_with(0), remote.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, remote.status());

        let mut state = FindingConnectionPointState::new(&config, peer.id(), 100);
        state.on_enter(&mut core);
        let id = last_request_id(&peer);
        let window = state.finder.window();

        state.new_connection_point_data(&mut core, &peer.id(), id + 100, remote.block(50).hash());
        assert_eq!(state.finder.window(), window);
    }

    #[test]
    fn test_side_chain_block_is_carried_by_hash() {
        let local = TestChain::new(300);
        let remote = local.fork(137, 400, 1);
        let config = SyncConfig::immediate_for_testing();
        let store = local.store_with(300);
        remote.save_side(store.as_ref(), 138, 150);
        let mut core = test_core(config.clone(), store, local.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, remote.status());

        let mut state = FindingConnectionPointState::new(&config, peer.id(), remote.best_number());
        state.on_enter(&mut core);
        drive(&mut state, &mut core, &peer, &remote);

        match core.take_transition() {
            Some(SyncState::DownloadingSkeleton(next)) => {
                assert_eq!(*next.connection_point(), remote.header(150).identifier());
            }
            _ => panic!("expected the skeleton download to start"),
        }
    }

    #[test]
    fn test_unshared_history_falls_back_to_genesis() {
        let local = TestChain::new(50);
        let remote = local.fork(0, 100, 2);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), local.store_with(50), local.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, remote.status());

        let mut state = FindingConnectionPointState::new(&config, peer.id(), remote.best_number());
        state.on_enter(&mut core);
        drive(&mut state, &mut core, &peer, &remote);

        match core.take_transition() {
            Some(SyncState::DownloadingSkeleton(next)) => {
                assert_eq!(*next.connection_point(), local.genesis().header().identifier());
            }
            _ => panic!("expected the skeleton download to start"),
        }
    }
}
