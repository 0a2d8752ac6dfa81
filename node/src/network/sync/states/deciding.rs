use crate::network::sync::events::SyncEventsHandler;
use std::time::Duration;
use tracing::{debug, info};

/// Idle state: waits for enough peers, then picks a peer and a sync mode
pub struct PeerAndModeDecidingState {
    time_elapsed: Duration,
}

impl PeerAndModeDecidingState {
    pub fn new() -> Self {
        Self {
            time_elapsed: Duration::ZERO,
        }
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let now = ctx.now();
        ctx.peers_mut().clear_old_failed_peers(now);
        self.time_elapsed = Duration::ZERO;
    }

    pub fn on_peer_status(&mut self, ctx: &mut dyn SyncEventsHandler) {
        if ctx.peers().count(ctx.now()) >= ctx.config().expected_peers {
            self.try_start_syncing(ctx);
        }
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        let now = ctx.now();
        ctx.peers_mut().expire_stale(now);
        self.time_elapsed = self.time_elapsed.saturating_add(elapsed);

        if ctx.peers().count(now) > 0 && self.time_elapsed >= ctx.config().timeout_waiting_peers {
            self.try_start_syncing(ctx);
        }
    }

    fn try_start_syncing(&mut self, ctx: &mut dyn SyncEventsHandler) -> bool {
        self.try_start_snap_sync(ctx) || self.try_start_long_sync(ctx) || self.try_start_backward_sync(ctx)
    }

    fn try_start_snap_sync(&mut self, ctx: &mut dyn SyncEventsHandler) -> bool {
        if !ctx.config().snap_sync_enabled || !ctx.has_snapshot_processor() {
            return false;
        }
        let now = ctx.now();
        let Some(peer) = ctx.peers().best_snap_candidate(now) else {
            return false;
        };
        let distance = self.distance_to(ctx, &peer);
        if distance <= ctx.config().snapshot_sync_limit {
            return false;
        }

        info!("Starting snap sync, {} blocks behind {}", distance, peer);
        ctx.start_snap_capable_peer_selection();
        true
    }

    fn try_start_long_sync(&mut self, ctx: &mut dyn SyncEventsHandler) -> bool {
        let Some(peer) = ctx.peers().best_candidate(ctx.now()) else {
            return false;
        };
        let distance = self.distance_to(ctx, &peer);
        let genesis_connected = ctx.block_store().min_number() == 0;
        if distance <= ctx.config().long_sync_limit && !genesis_connected {
            debug!("Peer {} is only {} blocks ahead", peer, distance);
            return false;
        }

        info!("Starting long sync with {}, {} blocks behind", peer, distance);
        ctx.start_syncing(peer);
        true
    }

    fn try_start_backward_sync(&mut self, ctx: &mut dyn SyncEventsHandler) -> bool {
        if ctx.block_store().min_number() == 0 {
            return false;
        }
        let Some(peer) = ctx.peers().best_or_equal(ctx.now()) else {
            return false;
        };

        info!("Starting backward sync with {}", peer);
        ctx.backward_syncing(peer);
        true
    }

    fn distance_to(&self, ctx: &dyn SyncEventsHandler, peer: &crate::network::PeerId) -> u64 {
        let local = ctx.block_store().best_number();
        ctx.peers()
            .status_of(peer)
            .map(|s| s.best_block_number.saturating_sub(local))
            .unwrap_or(0)
    }
}

impl Default for PeerAndModeDecidingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::network::sync::test_support::{connect, test_core, transition_name, RecordingPeer, TestChain};

    fn config(expected_peers: usize) -> SyncConfig {
        let mut config = SyncConfig::immediate_for_testing();
        config.expected_peers = expected_peers;
        config
    }

    #[test]
    fn test_waits_for_expected_peers() {
        let chain = TestChain::new(100);
        let mut core = test_core(config(2), chain.store_with(0), chain.genesis().clone());
        let mut state = PeerAndModeDecidingState::new();
        state.on_enter(&mut core);

        connect(&mut core, &RecordingPeer::new("a"), chain.status());
        state.on_peer_status(&mut core);
        assert_eq!(transition_name(&mut core), None);

        connect(&mut core, &RecordingPeer::new("b"), chain.status());
        state.on_peer_status(&mut core);
        assert_eq!(transition_name(&mut core), Some("CheckingBestHeader"));
    }

    #[test]
    fn test_starts_after_waiting_with_fewer_peers() {
        let chain = TestChain::new(100);
        let mut core = test_core(config(5), chain.store_with(0), chain.genesis().clone());
        let mut state = PeerAndModeDecidingState::new();
        state.on_enter(&mut core);

        connect(&mut core, &RecordingPeer::new("a"), chain.status());
        state.on_peer_status(&mut core);
        state.on_tick(&mut core, Duration::from_millis(500));
        assert_eq!(transition_name(&mut core), None);

        state.on_tick(&mut core, Duration::from_millis(500));
        assert_eq!(transition_name(&mut core), Some("CheckingBestHeader"));
    }

    #[test]
    fn test_no_sync_when_nobody_is_ahead() {
        let chain = TestChain::new(5);
        let mut core = test_core(config(1), chain.store_with(5), chain.genesis().clone());
        let mut state = PeerAndModeDecidingState::new();
        state.on_enter(&mut core);

        connect(&mut core, &RecordingPeer::new("a"), chain.status());
        state.on_peer_status(&mut core);
        assert_eq!(transition_name(&mut core), None);
    }

    #[test]
    fn test_short_distance_still_syncs_when_genesis_connected() {
        let chain = TestChain::new(3);
        let mut core = test_core(config(1), chain.store_with(1), chain.genesis().clone());
        let mut state = PeerAndModeDecidingState::new();

        connect(&mut core, &RecordingPeer::new("a"), chain.status());
        state.on_peer_status(&mut core);
        assert_eq!(transition_name(&mut core), Some("CheckingBestHeader"));
    }

    #[test]
    fn test_backward_sync_when_genesis_missing() {
        let chain = TestChain::new(50);
        // only the top of the chain is stored, genesis is not connected
        let mut core = test_core(config(1), chain.store_range(45, 50), chain.genesis().clone());
        let mut state = PeerAndModeDecidingState::new();

        connect(&mut core, &RecordingPeer::new("a"), chain.status());
        state.on_peer_status(&mut core);
        assert_eq!(transition_name(&mut core), Some("DownloadingBackwardsHeaders"));
    }
}
