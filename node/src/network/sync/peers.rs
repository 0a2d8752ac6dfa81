//! Registry of known peers and the candidate ranking used to pick sync peers

use super::bounded_map::BoundedMap;
use super::peer_status::PeerStatus;
use super::scoring::{EventType, ScoringSink};
use crate::config::SyncConfig;
use crate::network::message::Status;
use crate::network::peer::{PeerId, PeerRef};
use crate::storage::BlockStore;
use chainsync_core::BlockDifficulty;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_SIZE_FAILURE_RECORDS: usize = 10;
const FAILURE_TIME_LIMIT: Duration = Duration::from_secs(600);

struct PeerEntry {
    peer: PeerRef,
    status: PeerStatus,
}

pub struct PeersInformation {
    store: Arc<dyn BlockStore>,
    scoring: Arc<dyn ScoringSink>,
    peers: BTreeMap<PeerId, PeerEntry>,
    failed_peers: BoundedMap<PeerId, Duration>,
    excluded: HashSet<PeerId>,
    expiration: Duration,
    top_best: f64,
}

impl PeersInformation {
    pub fn new(config: &SyncConfig, store: Arc<dyn BlockStore>, scoring: Arc<dyn ScoringSink>) -> Self {
        Self {
            store,
            scoring,
            peers: BTreeMap::new(),
            failed_peers: BoundedMap::new(MAX_SIZE_FAILURE_RECORDS),
            excluded: HashSet::new(),
            expiration: config.expiration_time_peer_status,
            top_best: config.top_best,
        }
    }

    /// Get or create the status record of a peer
    pub fn register(&mut self, peer: PeerRef, now: Duration) -> &mut PeerStatus {
        let id = peer.id();
        let entry = self.peers.entry(id).or_insert_with(|| {
            debug!("Registering peer {}", id);
            PeerEntry {
                peer: Arc::clone(&peer),
                status: PeerStatus::new(now),
            }
        });
        entry.peer = peer;
        entry.status.touch(now);
        &mut entry.status
    }

    /// Record a fresh status announcement. A peer excluded earlier in the
    /// attempt becomes a candidate again.
    pub fn update(&mut self, peer: PeerRef, status: Status, now: Duration) {
        let id = peer.id();
        self.register(peer, now).set_status(status, now);
        if self.excluded.remove(&id) {
            debug!("Peer {} re-enters candidacy after a new status", id);
        }
    }

    /// Refresh activity for a peer we just heard from
    pub fn touch(&mut self, peer: &PeerId, now: Duration) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.status.touch(now);
        }
    }

    /// Drop peers silent for longer than the expiry window
    pub fn expire_stale(&mut self, now: Duration) -> Vec<PeerId> {
        let expiration = self.expiration;
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.status.is_expired(now, expiration))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.peers.remove(id);
            self.excluded.remove(id);
            debug!("Peer {} status expired", id);
        }
        expired
    }

    pub fn disconnect(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_some() {
            info!("Peer {} disconnected", peer);
        }
        self.excluded.remove(peer);
    }

    /// Peers with a live status
    pub fn count(&self, now: Duration) -> usize {
        self.peers
            .values()
            .filter(|e| e.status.status().is_some() && !e.status.is_expired(now, self.expiration))
            .count()
    }

    pub fn get_peer(&self, peer: &PeerId) -> Option<PeerRef> {
        self.peers.get(peer).map(|e| Arc::clone(&e.peer))
    }

    pub fn status_of(&self, peer: &PeerId) -> Option<&Status> {
        self.peers.get(peer).and_then(|e| e.status.status())
    }

    pub fn is_snap_capable(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|e| e.peer.is_snap_capable()).unwrap_or(false)
    }

    pub fn local_total_difficulty(&self) -> BlockDifficulty {
        self.store.best_total_difficulty()
    }

    /// Best peer claiming strictly more work than the local chain
    pub fn best_candidate(&self, now: Duration) -> Option<PeerId> {
        self.best_candidate_where(now, |_, _| true)
    }

    /// Best peer claiming strictly more work and satisfying `predicate`
    pub fn best_candidate_where<F>(&self, now: Duration, predicate: F) -> Option<PeerId>
    where
        F: Fn(&PeerRef, &Status) -> bool,
    {
        let local = self.local_total_difficulty();
        let ranked = self.ranked(now, |peer, status| {
            status.total_difficulty > local && predicate(peer, status)
        });
        self.pick(ranked)
    }

    /// Best peer claiming at least as much work as the local chain
    pub fn best_or_equal(&self, now: Duration) -> Option<PeerId> {
        let local = self.local_total_difficulty();
        let ranked = self.ranked(now, |_, status| status.total_difficulty >= local);
        self.pick(ranked)
    }

    pub fn best_snap_candidate(&self, now: Duration) -> Option<PeerId> {
        self.best_candidate_where(now, |peer, _| peer.is_snap_capable())
    }

    /// Every candidate ahead of us, best first
    pub fn best_candidates(&self, now: Duration) -> Vec<PeerId> {
        let local = self.local_total_difficulty();
        self.ranked(now, |_, status| status.total_difficulty > local)
    }

    pub fn snap_candidates(&self, now: Duration) -> Vec<PeerId> {
        let local = self.local_total_difficulty();
        self.ranked(now, |peer, status| {
            peer.is_snap_capable() && status.total_difficulty > local
        })
    }

    fn ranked<F>(&self, now: Duration, predicate: F) -> Vec<PeerId>
    where
        F: Fn(&PeerRef, &Status) -> bool,
    {
        let mut candidates: Vec<(PeerId, Option<Duration>, BlockDifficulty)> = self
            .peers
            .iter()
            .filter(|(id, _)| !self.excluded.contains(*id))
            .filter(|(_, e)| !e.status.is_expired(now, self.expiration))
            .filter(|(id, _)| self.scoring.has_good_reputation(id))
            .filter_map(|(id, e)| {
                let status = e.status.status()?;
                predicate(&e.peer, status).then(|| {
                    (*id, self.failed_peers.get(id).copied(), status.total_difficulty)
                })
            })
            .collect();

        // never failed first, then oldest failure, then most work
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
        candidates.into_iter().map(|(id, _, _)| id).collect()
    }

    fn pick(&self, ranked: Vec<PeerId>) -> Option<PeerId> {
        if ranked.is_empty() || self.top_best <= 0.0 {
            return ranked.first().copied();
        }
        let top = ((ranked.len() as f64 * self.top_best / 100.0).round() as usize).clamp(1, ranked.len());
        ranked[..top].choose(&mut rand::thread_rng()).copied()
    }

    /// A peer broke the current attempt: remember when, report it and keep
    /// it out of candidacy until it announces a new status.
    pub fn process_syncing_error(&mut self, peer: &PeerId, event: EventType, context: &str, now: Duration) {
        self.failed_peers.insert(*peer, now);
        self.report_event(peer, event, context);
    }

    /// Report a scoring event and exclude the peer from this attempt
    pub fn report_event(&mut self, peer: &PeerId, event: EventType, context: &str) {
        warn!("Reporting {} for peer {}: {}", event, peer, context);
        self.scoring.record_event(peer, event, context);
        self.excluded.insert(*peer);
    }

    pub fn record_good_response(&self, peer: &PeerId) {
        self.scoring.record_good_response(peer);
    }

    /// Forget failures older than the recency window
    pub fn clear_old_failed_peers(&mut self, now: Duration) {
        self.failed_peers
            .retain(|_, failed_at| now.saturating_sub(*failed_at) <= FAILURE_TIME_LIMIT);
    }

    pub fn is_excluded(&self, peer: &PeerId) -> bool {
        self.excluded.contains(peer)
    }

    pub fn last_failure(&self, peer: &PeerId) -> Option<Duration> {
        self.failed_peers.get(peer).copied()
    }

    pub fn known_peers(&self) -> usize {
        self.peers.len()
    }
}
