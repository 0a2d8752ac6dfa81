use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::chunk::ChunkDescriptor;
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::scoring::EventType;
use chainsync_core::{Block, BlockHeader};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Fetches the headers right below the lowest stored block
pub struct DownloadingBackwardsHeadersState {
    peer: PeerId,
    chunk_size: u32,
    timer: BaseTimer,
    child: Option<Block>,
    expected_count: usize,
    request_id: Option<u64>,
}

impl DownloadingBackwardsHeadersState {
    pub fn new(config: &SyncConfig, peer: PeerId) -> Self {
        Self {
            peer,
            chunk_size: config.chunk_size,
            timer: BaseTimer::new(config.timeout_waiting_request),
            child: None,
            expected_count: 0,
            request_id: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let store = ctx.block_store();
        let child = match store.get_by_number(store.min_number()) {
            Some(child) if child.number() > 0 => child,
            _ => {
                info!("Local chain already reaches genesis");
                ctx.stop_syncing();
                return;
            }
        };

        // never below block 1; genesis is connected from local knowledge
        let below = u64::from(self.chunk_size).min(child.number() - 1);
        let count = below + 1;
        let chunk = ChunkDescriptor::new(child.hash(), u32::try_from(count).unwrap_or(u32::MAX));
        debug!("Requesting {} from {}", chunk, self.peer);

        self.expected_count = count as usize;
        self.request_id = ctx.send_block_headers_request(&self.peer, chunk);
        self.child = Some(child);
        if self.request_id.is_none() {
            ctx.stop_syncing();
        }
    }

    pub fn new_block_headers(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        headers: Vec<BlockHeader>,
    ) {
        if self.request_id != Some(id) {
            trace!("Ignoring headers #{} from {}", id, peer);
            return;
        }
        self.request_id = None;
        let Some(child) = self.child.take() else {
            return;
        };

        if headers.len() != self.expected_count {
            ctx.on_error_syncing(peer, EventType::InvalidMessage, "Unexpected chunk size");
            return;
        }
        if headers.first().map(|h| h.hash()) != Some(child.hash()) {
            ctx.on_error_syncing(peer, EventType::InvalidMessage, "Unexpected chunk header hash");
            return;
        }
        // newest first: every header extends the one after it
        for pair in headers.windows(2) {
            if !ctx.validation_rules().header_extends(&pair[0], &pair[1]) {
                let context = format!("Invalid header #{}", pair[1].number);
                ctx.on_error_syncing(peer, EventType::InvalidHeader, &context);
                return;
            }
        }

        self.timer.reset();
        ctx.peers().record_good_response(peer);
        let to_request = headers.into_iter().skip(1).collect();
        ctx.backward_download_bodies(child, to_request, self.peer);
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(
                &self.peer,
                EventType::TimeoutMessage,
                "Timeout waiting backward headers",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::SyncMessage;
    use crate::network::peer::Peer;
    use crate::network::sync::test_support::{
        connect, last_request_id, test_core, transition_name, RecordingPeer, TestChain,
    };

    #[test]
    fn test_requests_down_to_block_one() {
        let chain = TestChain::new(60);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), chain.store_range(50, 60), chain.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, chain.status());

        let mut state = DownloadingBackwardsHeadersState::new(&config, peer.id());
        state.on_enter(&mut core);

        match peer.last_sent() {
            Some(SyncMessage::BlockHeadersRequest { hash, count, .. }) => {
                assert_eq!(hash, chain.block(50).hash());
                assert_eq!(count, 50);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let id = last_request_id(&peer);
        state.new_block_headers(&mut core, &peer.id(), id, chain.headers_down(50, 50));
        assert_eq!(transition_name(&mut core), Some("DownloadingBackwardsBodies"));
    }

    #[test]
    fn test_caps_request_at_chunk_size() {
        let chain = TestChain::new(500);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), chain.store_range(400, 500), chain.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, chain.status());

        let mut state = DownloadingBackwardsHeadersState::new(&config, peer.id());
        state.on_enter(&mut core);
        assert!(matches!(
            peer.last_sent(),
            Some(SyncMessage::BlockHeadersRequest { count: 193, .. })
        ));
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let chain = TestChain::new(60);
        let config = SyncConfig::immediate_for_testing();
        let mut core = test_core(config.clone(), chain.store_range(50, 60), chain.genesis().clone());
        let peer = RecordingPeer::new("a");
        connect(&mut core, &peer, chain.status());

        let mut state = DownloadingBackwardsHeadersState::new(&config, peer.id());
        state.on_enter(&mut core);
        let id = last_request_id(&peer);
        state.new_block_headers(&mut core, &peer.id(), id, chain.headers_down(50, 49));
        assert_eq!(transition_name(&mut core), Some("PeerAndModeDeciding"));
    }
}
