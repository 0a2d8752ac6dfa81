use super::BaseTimer;
use crate::config::SyncConfig;
use crate::network::peer::PeerId;
use crate::network::sync::events::{Skeletons, SyncEventsHandler};
use crate::network::sync::scoring::EventType;
use crate::storage::BlockStore;
use chainsync_core::{BlockIdentifier, Hash256};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Why a skeleton was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkeletonIssue {
    /// Not enough links to download anything; nobody is at fault
    #[error("skeleton has {0} links")]
    Insufficient(usize),

    #[error("{0}")]
    Invalid(String),
}

/// Check a skeleton against the connection point and the local chain
pub fn validate_skeleton(
    links: &[BlockIdentifier],
    connection_point: &BlockIdentifier,
    chunk_size: u32,
    store: &dyn BlockStore,
) -> Result<(), SkeletonIssue> {
    if links.len() < 2 {
        return Err(SkeletonIssue::Insufficient(links.len()));
    }
    if links.windows(2).any(|w| w[1].number <= w[0].number) {
        return Err(SkeletonIssue::Invalid("links are not ascending".to_string()));
    }
    if links[0].number > connection_point.number || links[1].number <= connection_point.number {
        return Err(SkeletonIssue::Invalid(format!(
            "skeleton does not straddle connection point {}",
            connection_point
        )));
    }
    if links
        .windows(2)
        .any(|w| w[1].number - w[0].number > u64::from(chunk_size))
    {
        return Err(SkeletonIssue::Invalid("links are further apart than a chunk".to_string()));
    }
    if let Some(local) = shared_ancestor(store, connection_point, links[0].number) {
        if local != links[0].hash {
            return Err(SkeletonIssue::Invalid(format!(
                "first link {} is not on the shared chain",
                links[0]
            )));
        }
    }
    Ok(())
}

/// Hash of the ancestor of the connection point at `number`, following
/// parent links so side chains resolve too. `None` when the walk leaves the
/// stored blocks.
fn shared_ancestor(store: &dyn BlockStore, connection_point: &BlockIdentifier, number: u64) -> Option<Hash256> {
    let mut hash = connection_point.hash;
    for _ in number..connection_point.number {
        hash = *store.get_by_hash(&hash)?.parent_hash();
    }
    Some(hash)
}

/// Asks every candidate for its skeleton above the connection point
pub struct DownloadingSkeletonState {
    selected: PeerId,
    connection_point: BlockIdentifier,
    chunk_size: u32,
    timer: BaseTimer,
    awaiting: HashMap<PeerId, u64>,
    skeletons: Skeletons,
}

impl DownloadingSkeletonState {
    pub fn new(config: &SyncConfig, connection_point: BlockIdentifier, selected: PeerId) -> Self {
        Self {
            selected,
            connection_point,
            chunk_size: config.chunk_size,
            timer: BaseTimer::new(config.timeout_waiting_request),
            awaiting: HashMap::new(),
            skeletons: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.selected
    }

    pub fn connection_point(&self) -> &BlockIdentifier {
        &self.connection_point
    }

    pub fn on_enter(&mut self, ctx: &mut dyn SyncEventsHandler) {
        let mut peers = ctx.peers().best_candidates(ctx.now());
        if !peers.contains(&self.selected) {
            peers.insert(0, self.selected);
        }

        for peer in peers {
            if let Some(id) = ctx.send_skeleton_request(&peer, self.connection_point.number) {
                self.awaiting.insert(peer, id);
            }
        }

        if !self.awaiting.contains_key(&self.selected) {
            warn!("Could not ask {} for a skeleton", self.selected);
            ctx.stop_syncing();
            return;
        }
        debug!(
            "Requested skeletons above {} from {} peers",
            self.connection_point,
            self.awaiting.len()
        );
    }

    pub fn new_skeleton(
        &mut self,
        ctx: &mut dyn SyncEventsHandler,
        peer: &PeerId,
        id: u64,
        links: Vec<BlockIdentifier>,
    ) {
        if self.awaiting.get(peer) != Some(&id) {
            trace!("Ignoring skeleton #{} from {}", id, peer);
            return;
        }
        self.awaiting.remove(peer);
        let is_selected = *peer == self.selected;

        let store = ctx.block_store();
        match validate_skeleton(&links, &self.connection_point, self.chunk_size, store.as_ref()) {
            Ok(()) => {
                if is_selected {
                    self.timer.reset();
                }
                ctx.peers().record_good_response(peer);
                self.skeletons.insert(*peer, links);
            }
            Err(SkeletonIssue::Insufficient(count)) if is_selected => {
                info!("Skeleton from {} has {} links, nothing to download", peer, count);
                ctx.stop_syncing();
                return;
            }
            Err(SkeletonIssue::Insufficient(count)) => {
                debug!("Skeleton from {} has {} links, ignoring it", peer, count);
            }
            Err(SkeletonIssue::Invalid(reason)) if is_selected => {
                ctx.on_error_syncing(peer, EventType::InvalidMessage, &reason);
                return;
            }
            Err(SkeletonIssue::Invalid(reason)) => {
                ctx.on_sync_issue(peer, EventType::InvalidMessage, &reason);
            }
        }

        if self.awaiting.is_empty() {
            self.finish(ctx);
        }
    }

    fn finish(&mut self, ctx: &mut dyn SyncEventsHandler) {
        if !self.skeletons.contains_key(&self.selected) {
            ctx.stop_syncing();
            return;
        }
        let skeletons = std::mem::take(&mut self.skeletons);
        ctx.start_downloading_headers(skeletons, self.connection_point, self.selected);
    }

    pub fn on_tick(&mut self, ctx: &mut dyn SyncEventsHandler, elapsed: Duration) {
        if !self.timer.tick(elapsed) {
            return;
        }
        if self.skeletons.contains_key(&self.selected) {
            debug!("{} peers did not send a skeleton in time", self.awaiting.len());
            self.awaiting.clear();
            self.finish(ctx);
        } else {
            ctx.on_error_syncing(&self.selected, EventType::TimeoutMessage, "Timeout waiting skeleton");
        }
    }
}
