//! Peer scoring events and the in-memory score board

use crate::network::peer::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

const MIN_PEER_SCORE: i32 = -100;
const MAX_PEER_SCORE: i32 = 100;
const DEFAULT_PEER_SCORE: i32 = 0;
const PEER_SCORE_GOOD_RESPONSE: i32 = 1;
const PEER_SCORE_INVALID_DATA: i32 = -10;
const PEER_SCORE_UNEXPECTED: i32 = -5;
const PEER_SCORE_TIMEOUT: i32 = -5;
/// At or below this a peer no longer has a good reputation
pub const BAD_REPUTATION_THRESHOLD: i32 = -50;

/// Misbehaviour a peer can be reported for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    InvalidBlock,
    InvalidHeader,
    InvalidMessage,
    UnexpectedMessage,
    TimeoutMessage,
}

impl EventType {
    fn penalty(&self) -> i32 {
        match self {
            EventType::InvalidBlock | EventType::InvalidHeader | EventType::InvalidMessage => {
                PEER_SCORE_INVALID_DATA
            }
            EventType::UnexpectedMessage => PEER_SCORE_UNEXPECTED,
            EventType::TimeoutMessage => PEER_SCORE_TIMEOUT,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::InvalidBlock => "INVALID_BLOCK",
            EventType::InvalidHeader => "INVALID_HEADER",
            EventType::InvalidMessage => "INVALID_MESSAGE",
            EventType::UnexpectedMessage => "UNEXPECTED_MESSAGE",
            EventType::TimeoutMessage => "TIMEOUT_MESSAGE",
        };
        f.write_str(name)
    }
}

/// Destination of peer scoring events. Persisting reputation is up to the
/// implementation; sync only emits events and asks for a verdict.
pub trait ScoringSink: Send + Sync {
    fn record_event(&self, peer: &PeerId, event: EventType, context: &str);

    fn has_good_reputation(&self, peer: &PeerId) -> bool;

    /// A request was answered correctly
    fn record_good_response(&self, _peer: &PeerId) {}
}

/// Data maintained for each scored peer
#[derive(Debug, Clone, Default)]
pub struct PeerScore {
    pub score: i32,
    pub good_responses: u64,
    pub timeouts: u64,
    pub invalid_data: u64,
    pub unexpected: u64,
}

impl PeerScore {
    fn new() -> Self {
        Self {
            score: DEFAULT_PEER_SCORE,
            ..Default::default()
        }
    }

    fn update_score(&mut self, delta: i32) {
        self.score = (self.score + delta).clamp(MIN_PEER_SCORE, MAX_PEER_SCORE);
    }
}

/// In-memory scoring, lost on restart
#[derive(Default)]
pub struct PeerScoreBoard {
    scores: Mutex<HashMap<PeerId, PeerScore>>,
}

impl PeerScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score_of(&self, peer: &PeerId) -> Option<PeerScore> {
        self.scores.lock().get(peer).cloned()
    }

    /// Number of events of any kind recorded against a peer
    pub fn event_count(&self, peer: &PeerId) -> u64 {
        self.scores
            .lock()
            .get(peer)
            .map(|s| s.timeouts + s.invalid_data + s.unexpected)
            .unwrap_or(0)
    }
}

impl ScoringSink for PeerScoreBoard {
    fn record_event(&self, peer: &PeerId, event: EventType, context: &str) {
        let mut scores = self.scores.lock();
        let entry = scores.entry(*peer).or_insert_with(PeerScore::new);
        entry.update_score(event.penalty());
        match event {
            EventType::TimeoutMessage => entry.timeouts += 1,
            EventType::UnexpectedMessage => entry.unexpected += 1,
            _ => entry.invalid_data += 1,
        }
        warn!("Peer {} scored {}: {} (score {})", peer, event, context, entry.score);
    }

    fn has_good_reputation(&self, peer: &PeerId) -> bool {
        self.scores
            .lock()
            .get(peer)
            .map(|s| s.score > BAD_REPUTATION_THRESHOLD)
            .unwrap_or(true)
    }

    fn record_good_response(&self, peer: &PeerId) {
        let mut scores = self.scores.lock();
        let entry = scores.entry(*peer).or_insert_with(PeerScore::new);
        entry.update_score(PEER_SCORE_GOOD_RESPONSE);
        entry.good_responses += 1;
        debug!("Peer {} answered correctly (score {})", peer, entry.score);
    }
}
