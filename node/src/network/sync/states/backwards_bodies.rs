use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::scoring::EventType;
use chainsync_core::{Block, BlockBody, BlockHeader};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Downloads bodies below `child` and links them downward, finally
/// attaching the local genesis block.
pub struct DownloadingBackwardsBodiesState {
    peer: PeerId,
    max_requested_bodies: usize,
    timer: BaseTimer,
    child: Block,
    /// Newest first
    to_request: VecDeque<BlockHeader>,
    in_transit: HashMap<u64, BlockHeader>,
    /// Downloaded blocks by height, waiting for their child to be stored
    responses: BTreeMap<u64, Block>,
}

impl DownloadingBackwardsBodiesState {
    pub fn new(config: &SyncConfig, child: Block, to_request: Vec<BlockHeader>, peer: PeerId) -> Self {
        Self {
            peer,
            max_requested_bodies: config.max_requested_bodies,
            timer: BaseTimer::new(config.timeout_waiting_request),
            child,
            to_request: to_request.into(),
            in_transit: HashMap::new(),
            responses: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        if self.child.number() == 1 {
            self.connect_genesis(ctx);
            return;
        }
        if self.to_request.is_empty() {
            ctx.stop_syncing();
            return;
        }
        self.request_bodies(ctx);
    }

    fn request_bodies(&mut self, ctx: &mut dyn SyncEventsHandler) {
        while self.in_transit.len() < self.max_requested_bodies {
            let Some(header) = self.to_request.pop_front() else {
                break;
            };
            match ctx.send_body_request(&self.peer, &header) {
                Some(id) => {
                    self.in_transit.insert(id, header);
                }
                None => {
                    ctx.stop_syncing();
                    return;
                }
            }
        }
    }

    pub fn new_body(&mut self, ctx: &mut dyn SyncEventsHandler, peer: &PeerId, id: u64, body: BlockBody) {
        let Some(header) = self.in_transit.remove(&id) else {
            trace!("Ignoring body #{} from {}", id, peer);
            return;
        };

        let block = Block::new(header, body);
        if !ctx.validation_rules().block_is_valid(&block) {
            ctx.on_error_syncing(peer, EventType::InvalidMessage, "Body does not match its header");
            return;
        }

        self.timer.reset();
        ctx.peers().record_good_response(peer);
        self.responses.insert(block.number(), block);

        let store = ctx.block_store();
        while let Some(entry) = self.responses.last_entry() {
            if !entry.get().is_parent_of(&self.child) {
                break;
            }
            let Some(child_td) = store.total_difficulty_for(&self.child.hash()) else {
                warn!("Lowest stored block #{} lost its total difficulty", self.child.number());
                ctx.stop_syncing();
                return;
            };
            let total_difficulty = match child_td.checked_sub(self.child.cumulative_difficulty()) {
                Ok(td) => td,
                Err(e) => {
                    ctx.on_error_syncing(peer, EventType::InvalidBlock, &e.to_string());
                    return;
                }
            };

            let block = entry.remove();
            if let Err(e) = store.save(&block, total_difficulty, true) {
                warn!("Failed to store block #{}: {}", block.number(), e);
                ctx.stop_syncing();
                return;
            }
            trace!("Connected block #{} backwards", block.number());
            self.child = block;
        }

        if self.child.number() == 1 {
            self.connect_genesis(ctx);
            return;
        }
        if self.to_request.is_empty() && self.in_transit.is_empty() {
            debug!("Batch done, lowest block is now #{}", self.child.number());
            ctx.backward_syncing(self.peer);
            return;
        }
        self.request_bodies(ctx);
    }

    /// The genesis block is only connected when it is the parent of block 1
    /// and accounts for exactly the work below it.
    fn connect_genesis(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let genesis = ctx.genesis().clone();
        let store = ctx.block_store();
        let expected = store
            .total_difficulty_for(&self.child.hash())
            .and_then(|td| td.checked_sub(self.child.cumulative_difficulty()).ok());

        if !genesis.is_parent_of(&self.child) || expected != Some(genesis.cumulative_difficulty()) {
            ctx.on_error_syncing(&self.peer, EventType::InvalidBlock, "Genesis does not connect");
            return;
        }

        if let Err(e) = store.save(&genesis, genesis.cumulative_difficulty(), true) {
            warn!("Failed to store genesis: {}", e);
        } else {
            info!("Backward sync reached genesis");
        }
        ctx.stop_syncing();
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if self.timer.tick(elapsed) {
            ctx.on_error_syncing(&self.peer, EventType::TimeoutMessage, "Timeout waiting backward bodies");
        }
    }
}
