use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::chunk::ChunkDescriptor;
use crate::network::sync::events::SyncEventsHandler;
use crate::network::sync::scoring::EventType;
use chainsync_core::{BlockDifficulty, BlockHeader, Hash256};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Headers fetched below a checkpoint to check a peer's claimed work
pub const HEADERS_VALIDATION_COUNT: u32 = 64;

enum Stage {
    Hash { id: u64, checkpoint: u64 },
    Headers { id: u64, hash: Hash256 },
}

struct Candidate {
    peer: PeerId,
    checkpoint: BlockHeader,
    work: BlockDifficulty,
}

/// Asks every snap-capable candidate for the headers below its checkpoint
/// and starts snap sync with the best supported one.
pub struct SnapCapablePeerSelectionState {
    chunk_size: u64,
    checkpoint_distance: u64,
    boot_nodes: HashSet<PeerId>,
    timer: BaseTimer,
    awaiting: HashMap<PeerId, Stage>,
    validated: Vec<Candidate>,
}

impl SnapCapablePeerSelectionState {
    pub fn new(config: &SyncConfig) -> Self {
        let boot_nodes = config
            .snap_boot_nodes
            .iter()
            .filter_map(|node| PeerId::from_hex(node).ok())
            .collect();
        Self {
            chunk_size: u64::from(config.chunk_size),
            checkpoint_distance: config.snap_checkpoint_distance,
            boot_nodes,
            timer: BaseTimer::new(config.timeout_waiting_request),
            awaiting: HashMap::new(),
            validated: Vec::new(),
        }
    }

    /// Height a peer's snapshot would be anchored to, if it is deep enough
    fn checkpoint_for(&self, best_number: u64) -> Option<u64> {
        let checkpoint = best_number.saturating_sub(self.checkpoint_distance);
        let checkpoint = checkpoint - checkpoint % self.chunk_size.max(1);
        (checkpoint >= u64::from(HEADERS_VALIDATION_COUNT)).then_some(checkpoint)
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let mut candidates = ctx.peers().snap_candidates(ctx.now());
        if candidates.iter().any(|p| self.boot_nodes.contains(p)) {
            candidates.retain(|p| self.boot_nodes.contains(p));
            debug!("Restricting snap selection to {} boot nodes", candidates.len());
        }

        for peer in candidates {
            let Some(best_number) = ctx.peers().status_of(&peer).map(|s| s.best_block_number) else {
                continue;
            };
            let Some(checkpoint) = self.checkpoint_for(best_number) else {
                trace!("{} is too short for a snapshot checkpoint", peer);
                continue;
            };
            if let Some(id) = ctx.send_block_hash_request(&peer, checkpoint) {
                self.awaiting.insert(peer, Stage::Hash { id, checkpoint });
            }
        }

        if self.awaiting.is_empty() {
            info!("No snap-capable peer to sync from");
            ctx.stop_syncing();
        }
    }

    pub fn new_block_hash(&mut self, ctx: &mut dyn SyncEventsHandler, peer: &PeerId, id: u64, hash: Hash256) {
        match self.awaiting.get(peer) {
            Some(Stage::Hash { id: expected, checkpoint }) if *expected == id => {
                debug!("{} anchors its snapshot at #{}", peer, checkpoint);
            }
            _ => {
                trace!("Ignoring block hash #{} from {}", id, peer);
                return;
            }
        }
        self.timer.reset();

        let chunk = ChunkDescriptor::new(hash, HEADERS_VALIDATION_COUNT);
        match ctx.send_block_headers_request(peer, chunk) {
            Some(id) => {
                self.awaiting.insert(*peer, Stage::Headers { id, hash });
            }
            None => {
                self.awaiting.remove(peer);
                self.try_choose(ctx);
            }
        }
    }

    pub fn new_block_headers(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        headers: Vec<BlockHeader>,
    ) {
        let hash = match self.awaiting.get(peer) {
            Some(Stage::Headers { id: expected, hash }) if *expected == id => *hash,
            _ => {
                trace!("Ignoring headers #{} from {}", id, peer);
                return;
            }
        };
        self.awaiting.remove(peer);
        self.timer.reset();

        match self.validate(ctx, &hash, &headers) {
            Ok(work) => {
                ctx.peers().record_good_response(peer);
                if let Some(checkpoint) = headers.into_iter().next() {
                    self.validated.push(Candidate {
                        peer: *peer,
                        checkpoint,
                        work,
                    });
                }
            }
            Err((event, reason)) => ctx.on_sync_issue(peer, event, reason),
        }
        self.try_choose(ctx);
    }

    fn validate(
        &self,
        ctx: &dyn SyncEventsHandler,
        hash: &Hash256,
        headers: &[BlockHeader],
    ) -> Result<BlockDifficulty, (EventType, &'static str)> {
        if headers.len() != HEADERS_VALIDATION_COUNT as usize {
            return Err((EventType::InvalidMessage, "Unexpected checkpoint header count"));
        }
        if headers[0].hash() != *hash {
            return Err((EventType::InvalidMessage, "Unexpected checkpoint hash"));
        }
        let rules = ctx.validation_rules();
        if !headers.iter().all(|h| rules.header.is_valid(h)) {
            return Err((EventType::InvalidHeader, "Invalid checkpoint header"));
        }
        if !headers.windows(2).all(|pair| rules.header_extends(&pair[0], &pair[1])) {
            return Err((EventType::InvalidHeader, "Checkpoint headers do not link"));
        }
        Ok(headers
            .iter()
            .fold(BlockDifficulty::ZERO, |acc, h| acc + h.difficulty))
    }

    fn try_choose(&mut self, ctx: &mut dyn SyncEventsHandler) {
        if self.awaiting.is_empty() {
            self.choose(ctx);
        }
    }

    /// Weight each checkpoint by how many peers share it, then prefer the
    /// peer announcing more total difficulty.
    fn choose(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let mut support: HashMap<Hash256, u128> = HashMap::new();
        for candidate in &self.validated {
            *support.entry(candidate.checkpoint.hash()).or_default() += 1;
        }

        let peers = ctx.peers();
        let best = self
            .validated
            .iter()
            .max_by_key(|c| {
                let weight = support.get(&c.checkpoint.hash()).copied().unwrap_or(1);
                let score = c.work.value().saturating_mul(weight);
                let announced = peers
                    .status_of(&c.peer)
                    .map(|s| s.total_difficulty)
                    .unwrap_or(BlockDifficulty::ZERO);
                (score, announced, std::cmp::Reverse(c.peer))
            })
            .map(|c| (c.peer, c.checkpoint.clone()));

        match best {
            Some((peer, checkpoint)) => {
                info!("Selected {} for snap sync at checkpoint #{}", peer, checkpoint.number);
                ctx.start_snap_sync(peer, checkpoint);
            }
            None => {
                warn!("No snap-capable peer passed checkpoint validation");
                ctx.stop_syncing();
            }
        }
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if !self.timer.tick(elapsed) {
            return;
        }
        let silent: Vec<PeerId> = self.awaiting.drain().map(|(peer, _)| peer).collect();
        for peer in silent {
            ctx.on_sync_issue(&peer, EventType::TimeoutMessage, "Timeout waiting snap checkpoint");
        }
        self.choose(ctx);
    }
}
