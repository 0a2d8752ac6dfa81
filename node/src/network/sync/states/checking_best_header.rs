use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::chunk::ChunkDescriptor;
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::scoring::EventType;
use chainsync_core::{BlockHeader, Hash256};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Asks the selected peer for the header of the best block it announced
pub struct CheckingBestHeaderState {
    peer: PeerId,
    timer: BaseTimer,
    expected_hash: Option<Hash256>,
    request_id: Option<u64>,
}

impl CheckingBestHeaderState {
    pub fn new(config: &SyncConfig, peer: PeerId) -> Self {
        Self {
            peer,
            timer: BaseTimer::new(config.timeout_waiting_request),
            expected_hash: None,
            request_id: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let Some(status) = ctx.peers().status_of(&self.peer).cloned() else {
            warn!("No status known for {}, cannot check its best header", self.peer);
            ctx.stop_syncing();
            return;
        };

        let chunk = ChunkDescriptor::new(status.best_block_hash, 1);
        debug!("Checking best header {} of {}", chunk, self.peer);
        self.expected_hash = Some(status.best_block_hash);
        self.request_id = ctx.send_block_headers_request(&self.peer, chunk);
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

        let valid = match (headers.as_slice(), self.expected_hash) {
            ([header], Some(expected)) => {
                header.hash() == expected && ctx.validation_rules().header.is_valid(header)
            }
            _ => false,
        };
        if !valid {
            ctx.on_error_syncing(peer, EventType::InvalidHeader, "Invalid best header");
            return;
        }

        self.timer.reset();
        ctx.peers().record_good_response(peer);
        ctx.start_finding_connection_point(self.peer);
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(&self.peer, EventType::TimeoutMessage, "Timeout waiting best header");
        }
    }
}
