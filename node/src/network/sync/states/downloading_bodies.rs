use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::events::{Skeletons, SyncEventsHandler};
use crate::network::sync::scoring::EventType;
use crate::storage::StorageError;
use chainsync_core::{Block, BlockBody, BlockHeader, ChainError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
enum ConnectError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

struct BodyRequest {
    peer: PeerId,
    header: BlockHeader,
    chunk: usize,
    elapsed: Duration,
}

/// Downloads the bodies for validated headers from every peer whose
/// skeleton covers them, then connects blocks in height order.
pub struct DownloadingBodiesState {
    selected: PeerId,
    timeout: Duration,
    max_requested_bodies: usize,
    /// Headers still to request, per chunk, oldest first
    pending_headers: Vec<VecDeque<BlockHeader>>,
    /// Highest chunk index each suitable peer can serve
    reach: BTreeMap<PeerId, usize>,
    in_flight: HashMap<u64, BodyRequest>,
    busy: HashMap<PeerId, u64>,
    /// Valid blocks waiting for their parent, by height
    received: BTreeMap<u64, Block>,
    remaining: usize,
}

impl DownloadingBodiesState {
    pub fn new(
        config: &SyncConfig,
        pending_headers: Vec<VecDeque<BlockHeader>>,
        skeletons: Skeletons,
        selected: PeerId,
    ) -> Self {
        let reach = Self::compute_reach(&pending_headers, &skeletons, &selected);
        let remaining = pending_headers.iter().map(VecDeque::len).sum();
        Self {
            selected,
            timeout: config.timeout_waiting_request,
            max_requested_bodies: config.max_requested_bodies,
            pending_headers,
            reach,
            in_flight: HashMap::new(),
            busy: HashMap::new(),
            received: BTreeMap::new(),
            remaining,
        }
    }

    /// A peer can serve chunk `i` and everything below it when its skeleton
    /// link `i + 1` is the newest header of that chunk.
    fn compute_reach(
        pending_headers: &[VecDeque<BlockHeader>],
        skeletons: &Skeletons,
        selected: &PeerId,
    ) -> BTreeMap<PeerId, usize> {
        let mut reach = BTreeMap::new();
        let Some(last_chunk) = pending_headers.len().checked_sub(1) else {
            return reach;
        };
        reach.insert(*selected, last_chunk);

        for (peer, skeleton) in skeletons {
            if peer == selected {
                continue;
            }
            let highest = pending_headers
                .iter()
                .enumerate()
                .filter(|(i, chunk)| match (chunk.back(), skeleton.get(i + 1)) {
                    (Some(newest), Some(link)) => newest.hash() == link.hash,
                    _ => false,
                })
                .map(|(i, _)| i)
                .last();
            if let Some(highest) = highest {
                reach.insert(*peer, highest);
            }
        }
        reach
    }

    pub fn peer(&self) -> &PeerId {
        &self.selected
    }

    pub fn suitable_peers(&self) -> usize {
        self.reach.len()
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        info!(
            "Downloading {} bodies from {} peers",
            self.remaining,
            self.reach.len()
        );
        self.start_downloading(ctx);
    }

    fn start_downloading(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let peers: Vec<PeerId> = self.reach.keys().copied().collect();
        for peer in peers {
            if self.in_flight.len() >= self.max_requested_bodies {
                break;
            }
            if self.busy.contains_key(&peer) {
                continue;
            }
            let Some((chunk, header)) = self.next_header_for(ctx, &peer) else {
                continue;
            };

            match ctx.send_body_request(&peer, &header) {
                Some(id) => {
                    trace!("Requested body #{} from {}", header.number, peer);
                    self.busy.insert(peer, id);
                    self.in_flight.insert(
                        id,
                        BodyRequest {
                            peer,
                            header,
                            chunk,
                            elapsed: Duration::ZERO,
                        },
                    );
                }
                None => {
                    self.requeue(chunk, header);
                    self.reach.remove(&peer);
                }
            }
        }

        if self.is_complete() {
            info!("All bodies downloaded and connected");
            ctx.stop_syncing();
        } else if self.in_flight.is_empty() {
            warn!("No suitable peer can serve the remaining {} bodies", self.remaining);
            ctx.stop_syncing();
        }
    }

    /// Oldest header the peer can serve, skipping blocks already stored
    fn next_header_for(&mut self, ctx: &dyn SyncEventsHandler, peer: &PeerId) -> Option<(usize, BlockHeader)> {
        let reach = *self.reach.get(peer)?;
        let store = ctx.block_store();
        for (chunk, headers) in self.pending_headers.iter_mut().enumerate().take(reach + 1) {
            while let Some(header) = headers.pop_front() {
                if store.contains(&header.hash()) {
                    self.remaining = self.remaining.saturating_sub(1);
                    continue;
                }
                return Some((chunk, header));
            }
        }
        None
    }

    fn requeue(&mut self, chunk: usize, header: BlockHeader) {
        if let Some(headers) = self.pending_headers.get_mut(chunk) {
            headers.push_front(header);
        }
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn new_body(&mut self, ctx: &mut dyn SyncEventsHandler, peer: &PeerId, id: u64, body: BlockBody) {
        let Some(request) = self.in_flight.remove(&id) else {
            trace!("Ignoring body #{} from {}", id, peer);
            return;
        };
        self.busy.remove(&request.peer);

        let block = Block::new(request.header, body);
        if !ctx.validation_rules().block_is_valid(&block) {
            let (header, _) = block.into_parts();
            self.drop_peer(ctx, peer, request.chunk, header, EventType::InvalidMessage, "Invalid body");
            return;
        }

        ctx.peers().record_good_response(peer);
        self.received.insert(block.number(), block);
        if let Err(e) = self.connect_ready(ctx) {
            warn!("Failed to connect downloaded blocks: {}", e);
            ctx.stop_syncing();
            return;
        }
        self.start_downloading(ctx);
    }

    /// Store buffered blocks, lowest first, while their parent is stored
    fn connect_ready(&mut self, ctx: &mut dyn SyncEventsHandler) -> Result<(), ConnectError> {
        let store = ctx.block_store();
        while let Some(entry) = self.received.first_entry() {
            let Some(parent_td) = store.total_difficulty_for(entry.get().parent_hash()) else {
                break;
            };
            let block = entry.remove();
            let total_difficulty = parent_td.checked_add(block.cumulative_difficulty())?;
            store.save(&block, total_difficulty, true)?;
            debug!("Connected block #{} td={}", block.number(), total_difficulty);
            self.remaining = self.remaining.saturating_sub(1);
        }
        Ok(())
    }

    /// Stop using a peer for this attempt, handing its header back
    fn drop_peer(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        chunk: usize,
        header: BlockHeader,
        event: EventType,
        context: &str,
    ) {
        self.requeue(chunk, header);
        self.reach.remove(peer);
        if self.reach.is_empty() {
            ctx.on_error_syncing(peer, event, context);
            return;
        }
        ctx.on_sync_issue(peer, event, context);
        self.start_downloading(ctx);
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        let mut timed_out = Vec::new();
        for (id, request) in self.in_flight.iter_mut() {
            request.elapsed = request.elapsed.saturating_add(elapsed);
            if request.elapsed >= self.timeout {
                timed_out.push(*id);
            }
        }

        for id in timed_out {
            let Some(request) = self.in_flight.remove(&id) else {
                continue;
            };
            self.busy.remove(&request.peer);
            self.drop_peer(
                ctx,
                &request.peer,
                request.chunk,
                request.header,
                EventType::TimeoutMessage,
                "Timeout waiting body",
            );
            if self.reach.is_empty() {
                return;
            }
        }
    }
}
