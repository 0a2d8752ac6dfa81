use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::chunk::ChunkDescriptor;
use crate::network::sync::chunks::ChunksDownloadHelper;
use crate::network::sync::events::{Skeletons, SyncEventsHandler};
use crate::network::sync::scoring::EventType;
use chainsync_core::{BlockHeader, BlockIdentifier};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Fetches the selected peer's skeleton chunk by chunk, validating every
/// header against its parent. Nothing is stored here.
pub struct DownloadingHeadersState {
    selected: PeerId,
    connection_point: BlockIdentifier,
    skeletons: Skeletons,
    helper: ChunksDownloadHelper,
    timer: BaseTimer,
    pending_headers: Vec<VecDeque<BlockHeader>>,
    current: Option<(u64, ChunkDescriptor)>,
    anchor: Option<BlockHeader>,
}

impl DownloadingHeadersState {
    pub fn new(
        config: &SyncConfig,
        skeletons: Skeletons,
        connection_point: BlockIdentifier,
        selected: PeerId,
    ) -> Self {
        let skeleton = skeletons.get(&selected).cloned().unwrap_or_default();
        Self {
            selected,
            connection_point,
            helper: ChunksDownloadHelper::new(config.max_skeleton_chunks, connection_point.number, skeleton),
            skeletons,
            timer: BaseTimer::new(config.timeout_waiting_request),
            pending_headers: Vec::new(),
            current: None,
            anchor: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.selected
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        // by hash: the shared block may sit off the canonical index
        self.anchor = ctx
            .block_store()
            .get_by_hash(&self.connection_point.hash)
            .map(|b| b.header().clone());
        if self.anchor.is_none() {
            warn!("Connection point {} is not stored locally", self.connection_point);
            ctx.stop_syncing();
            return;
        }
        self.try_send_request(ctx);
    }

    fn try_send_request(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let Some(chunk) = self.helper.next_chunk() else {
            info!(
                "Downloaded {} header chunks from {}",
                self.pending_headers.len(),
                self.selected
            );
            let pending = std::mem::take(&mut self.pending_headers);
            let skeletons = std::mem::take(&mut self.skeletons);
            ctx.start_downloading_bodies(pending, skeletons, self.selected);
            return;
        };

        debug!("Requesting header chunk {} from {}", chunk, self.selected);
        match ctx.send_block_headers_request(&self.selected, chunk) {
            Some(id) => self.current = Some((id, chunk)),
            None => ctx.stop_syncing(),
        }
    }

    pub fn new_block_headers(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        headers: Vec<BlockHeader>,
    ) {
        let chunk = match self.current {
            Some((expected, chunk)) if expected == id => chunk,
            _ => {
                trace!("Ignoring headers #{} from {}", id, peer);
                return;
            }
        };
        self.current = None;

        if headers.len() != chunk.count() as usize {
            ctx.on_error_syncing(peer, EventType::InvalidMessage, "Unexpected chunk size");
            return;
        }
        if headers.first().map(|h| h.hash()) != Some(*chunk.hash()) {
            ctx.on_error_syncing(peer, EventType::InvalidMessage, "Unexpected chunk header hash");
            return;
        }

        let Some(mut parent) = self.anchor.clone() else {
            ctx.stop_syncing();
            return;
        };
        let mut chunk_headers = VecDeque::with_capacity(headers.len());
        // headers arrive newest first
        for header in headers.into_iter().rev() {
            if !ctx.validation_rules().header_extends(&header, &parent) {
                let context = format!("Invalid header #{}", header.number);
                ctx.on_error_syncing(peer, EventType::InvalidHeader, &context);
                return;
            }
            parent = header.clone();
            chunk_headers.push_back(header);
        }

        self.timer.reset();
        ctx.peers().record_good_response(peer);
        self.anchor = Some(parent);
        self.pending_headers.push(chunk_headers);
        self.try_send_request(ctx);
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(&self.selected, EventType::TimeoutMessage, "Timeout waiting headers");
        }
    }
}
