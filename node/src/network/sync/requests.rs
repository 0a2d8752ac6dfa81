//! Correlation of outbound requests with their responses

use super::bounded_map::BoundedMap;
use super::error::SyncError;
use super::peers::PeersInformation;
use crate::network::message::{MessageType, SyncMessage};
use crate::network::peer::PeerId;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Times a retryable request is re-issued before the exchange is given up
pub const MAX_RETRIES: u32 = 2;

/// Builds the outbound message for a freshly allocated request id
pub type RequestFactory = Box<dyn Fn(u64) -> SyncMessage + Send>;

/// Chooses the peer for a request, avoiding the peers listed as already tried
pub type PeerSelector = Box<dyn Fn(&PeersInformation, &[PeerId], Duration) -> Option<PeerId> + Send>;

struct Retry {
    factory: RequestFactory,
    selector: PeerSelector,
    tried: Vec<PeerId>,
}

/// An outstanding request
pub struct PendingRequest {
    pub id: u64,
    pub expected: MessageType,
    pub peer_id: PeerId,
    pub sent_at: Duration,
    pub retry_count: u32,
    retry: Option<Retry>,
}

impl PendingRequest {
    pub fn is_retryable(&self) -> bool {
        self.retry.is_some()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("expected", &self.expected)
            .field("peer_id", &self.peer_id)
            .field("sent_at", &self.sent_at)
            .field("retry_count", &self.retry_count)
            .field("retryable", &self.retry.is_some())
            .finish()
    }
}

/// Why a response was not matched to a pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRejection {
    NotAResponse(MessageType),
    UnknownId(u64),
    UnexpectedType { expected: MessageType, actual: MessageType },
    WrongPeer { expected: PeerId },
}

impl fmt::Display for ResponseRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseRejection::NotAResponse(t) => write!(f, "{} is not a response", t),
            ResponseRejection::UnknownId(id) => write!(f, "no pending request with id {}", id),
            ResponseRejection::UnexpectedType { expected, actual } => {
                write!(f, "expected {} but got {}", expected, actual)
            }
            ResponseRejection::WrongPeer { expected } => write!(f, "request was sent to {}", expected),
        }
    }
}

/// What a sweep did with one expired request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Re-issued under a fresh id
    Retried { previous_id: u64, id: u64, peer: PeerId },
    /// Retry ceiling reached or nobody left to ask
    Exhausted { id: u64, peer: PeerId, expected: MessageType },
    /// One-shot request dropped; its owner supervises the timeout
    Expired { id: u64, peer: PeerId, expected: MessageType },
}

pub struct PendingRequests {
    requests: BoundedMap<u64, PendingRequest>,
    last_id: u64,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        Self {
            requests: BoundedMap::new(capacity),
            last_id: 0,
            timeout,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// New requests are refused rather than evicting one that is still
    /// owed a response or a retry
    fn ensure_capacity(&self) -> Result<(), SyncError> {
        if self.requests.len() >= self.requests.capacity() {
            return Err(SyncError::TooManyPendingRequests(self.requests.len()));
        }
        Ok(())
    }

    fn track(&mut self, request: PendingRequest) {
        if let Some((evicted, old)) = self.requests.insert(request.id, request) {
            warn!("Pending table overflowed, dropped request {} to {}", evicted, old.peer_id);
        }
    }

    /// Send a one-shot request to a specific peer
    pub fn send<F>(
        &mut self,
        peers: &PeersInformation,
        peer_id: &PeerId,
        build: F,
        now: Duration,
    ) -> Result<u64, SyncError>
    where
        F: FnOnce(u64) -> SyncMessage,
    {
        self.ensure_capacity()?;
        let peer = peers.get_peer(peer_id).ok_or(SyncError::UnknownPeer(*peer_id))?;
        let id = self.allocate_id();
        let message = build(id);
        let expected = message
            .message_type()
            .expected_response()
            .ok_or(SyncError::NotARequest(message.message_type()))?;

        trace!("Sending {} #{} to {}", message.message_type(), id, peer_id);
        peer.send(message)?;
        self.track(PendingRequest {
            id,
            expected,
            peer_id: *peer_id,
            sent_at: now,
            retry_count: 0,
            retry: None,
        });
        Ok(id)
    }

    /// Send a request that is re-issued to another peer when it expires
    pub fn submit(
        &mut self,
        peers: &PeersInformation,
        selector: PeerSelector,
        factory: RequestFactory,
        now: Duration,
    ) -> Result<u64, SyncError> {
        self.ensure_capacity()?;
        let request_type = factory(0).message_type();
        let expected = request_type
            .expected_response()
            .ok_or(SyncError::NotARequest(request_type))?;
        let peer_id = selector(peers, &[], now).ok_or(SyncError::NoPeerAvailable)?;
        let id = self.dispatch(peers, &peer_id, &factory)?;

        self.track(PendingRequest {
            id,
            expected,
            peer_id,
            sent_at: now,
            retry_count: 0,
            retry: Some(Retry {
                factory,
                selector,
                tried: vec![peer_id],
            }),
        });
        Ok(id)
    }

    fn dispatch(&mut self, peers: &PeersInformation, peer_id: &PeerId, factory: &RequestFactory) -> Result<u64, SyncError> {
        let peer = peers.get_peer(peer_id).ok_or(SyncError::UnknownPeer(*peer_id))?;
        let id = self.allocate_id();
        let message = factory(id);
        trace!("Sending {} #{} to {}", message.message_type(), id, peer_id);
        peer.send(message)?;
        Ok(id)
    }

    /// Match a response against the table. A match removes the entry.
    pub fn on_response(&mut self, peer: &PeerId, message: &SyncMessage) -> Result<PendingRequest, ResponseRejection> {
        let actual = message.message_type();
        let id = match message.id() {
            Some(id) if actual.is_response() => id,
            _ => return Err(ResponseRejection::NotAResponse(actual)),
        };

        let pending = self.requests.get(&id).ok_or(ResponseRejection::UnknownId(id))?;
        if pending.expected != actual {
            return Err(ResponseRejection::UnexpectedType {
                expected: pending.expected,
                actual,
            });
        }
        if pending.peer_id != *peer {
            return Err(ResponseRejection::WrongPeer {
                expected: pending.peer_id,
            });
        }

        self.requests.remove(&id).ok_or(ResponseRejection::UnknownId(id))
    }

    /// Expire requests older than the timeout, re-issuing retryable ones
    pub fn sweep_expired(&mut self, peers: &PeersInformation, now: Duration) -> Vec<SweepOutcome> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(request) = self.requests.remove(&id) else {
                continue;
            };
            outcomes.push(self.expire(peers, request, now));
        }
        outcomes
    }

    fn expire(&mut self, peers: &PeersInformation, mut request: PendingRequest, now: Duration) -> SweepOutcome {
        let Some(mut retry) = request.retry.take() else {
            trace!("Request {} to {} expired", request.id, request.peer_id);
            return SweepOutcome::Expired {
                id: request.id,
                peer: request.peer_id,
                expected: request.expected,
            };
        };

        let exhausted = SweepOutcome::Exhausted {
            id: request.id,
            peer: request.peer_id,
            expected: request.expected,
        };
        if request.retry_count >= MAX_RETRIES {
            warn!(
                "Request {} ({}) exhausted {} retries",
                request.id, request.expected, MAX_RETRIES
            );
            return exhausted;
        }

        let alternate = (retry.selector)(peers, &retry.tried, now).or_else(|| (retry.selector)(peers, &[], now));
        let Some(peer_id) = alternate else {
            warn!("No peer left to retry request {}", request.id);
            return exhausted;
        };

        let id = match self.dispatch(peers, &peer_id, &retry.factory) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to re-issue request {}: {}", request.id, e);
                return exhausted;
            }
        };

        debug!(
            "Re-issued request {} as {} to {} (retry {})",
            request.id,
            id,
            peer_id,
            request.retry_count + 1
        );
        if !retry.tried.contains(&peer_id) {
            retry.tried.push(peer_id);
        }
        let previous_id = request.id;
        self.track(PendingRequest {
            id,
            expected: request.expected,
            peer_id,
            sent_at: now,
            retry_count: request.retry_count + 1,
            retry: Some(retry),
        });
        SweepOutcome::Retried {
            previous_id,
            id,
            peer: peer_id,
        }
    }

    /// Forget every retryable request, used when their owner goes away
    pub fn clear_retryable(&mut self) {
        self.requests.retain(|_, r| r.retry.is_none());
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&PendingRequest> {
        self.requests.get(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::network::message::{SnapKind, Status};
    use crate::network::peer::Peer;
    use crate::network::sync::scoring::PeerScoreBoard;
    use crate::network::sync::test_support::{RecordingPeer, TestChain};
    use chainsync_core::BlockDifficulty;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn peers_with(labels: &[&str]) -> (PeersInformation, Vec<Arc<RecordingPeer>>) {
        let chain = TestChain::new(1);
        let mut info = PeersInformation::new(
            &SyncConfig::default(),
            chain.store_with(0),
            Arc::new(PeerScoreBoard::new()),
        );
        let peers: Vec<_> = labels.iter().map(|l| RecordingPeer::new(l)).collect();
        for peer in &peers {
            info.update(
                peer.clone(),
                Status::new(10, [1u8; 32], BlockDifficulty(1_000)),
                Duration::ZERO,
            );
        }
        (info, peers)
    }

    fn snap_factory() -> RequestFactory {
        Box::new(|id| SyncMessage::SnapRequest {
            id,
            kind: SnapKind::StateChunk,
            payload: vec![1],
        })
    }

    fn any_candidate() -> PeerSelector {
        Box::new(|peers, tried, now| {
            peers
                .best_candidates(now)
                .into_iter()
                .find(|p| !tried.contains(p))
        })
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let (info, peers) = peers_with(&["a"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);

        let first = pending
            .send(&info, &peers[0].id(), |id| SyncMessage::BlockHashRequest { id, height: 1 }, Duration::ZERO)
            .unwrap();
        let response = SyncMessage::BlockHashResponse { id: first, hash: [0u8; 32] };
        assert!(pending.on_response(&peers[0].id(), &response).is_ok());

        let second = pending
            .send(&info, &peers[0].id(), |id| SyncMessage::BlockHashRequest { id, height: 2 }, Duration::ZERO)
            .unwrap();
        assert!(second > first);
        assert_eq!(
            pending.on_response(&peers[0].id(), &response).err(),
            Some(ResponseRejection::UnknownId(first))
        );
    }

    #[test]
    fn test_mismatched_type_and_peer_are_rejected_without_consuming() {
        let (info, peers) = peers_with(&["a", "b"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let id = pending
            .send(&info, &peers[0].id(), |id| SyncMessage::SkeletonRequest { id, start_number: 0 }, Duration::ZERO)
            .unwrap();

        let wrong_type = SyncMessage::BlockHashResponse { id, hash: [0u8; 32] };
        assert!(matches!(
            pending.on_response(&peers[0].id(), &wrong_type),
            Err(ResponseRejection::UnexpectedType { .. })
        ));

        let right = SyncMessage::SkeletonResponse { id, block_identifiers: vec![] };
        assert_eq!(
            pending.on_response(&peers[1].id(), &right).err(),
            Some(ResponseRejection::WrongPeer { expected: peers[0].id() })
        );
        assert!(pending.is_pending(id));
        assert!(pending.on_response(&peers[0].id(), &right).is_ok());
    }

    #[test]
    fn test_one_shot_requests_expire_silently() {
        let (info, peers) = peers_with(&["a"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let id = pending
            .send(&info, &peers[0].id(), |id| SyncMessage::BodyRequest { id, hash: [2u8; 32] }, Duration::ZERO)
            .unwrap();

        assert!(pending.sweep_expired(&info, Duration::from_secs(29)).is_empty());
        assert_eq!(
            pending.sweep_expired(&info, TIMEOUT),
            vec![SweepOutcome::Expired {
                id,
                peer: peers[0].id(),
                expected: MessageType::BodyResponse
            }]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_retry_prefers_alternate_peer_and_stops_at_ceiling() {
        let (info, peers) = peers_with(&["a", "b"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let id = pending
            .submit(&info, any_candidate(), snap_factory(), Duration::ZERO)
            .unwrap();
        let first_peer = pending.get(id).unwrap().peer_id;

        let mut now = Duration::ZERO;
        let mut retried_to = Vec::new();
        for _ in 0..MAX_RETRIES {
            now += TIMEOUT;
            match pending.sweep_expired(&info, now).as_slice() {
                [SweepOutcome::Retried { peer, .. }] => retried_to.push(*peer),
                other => panic!("expected a retry, got {:?}", other),
            }
        }
        assert_ne!(retried_to[0], first_peer);

        now += TIMEOUT;
        assert!(matches!(
            pending.sweep_expired(&info, now).as_slice(),
            [SweepOutcome::Exhausted { expected: MessageType::SnapResponse(SnapKind::StateChunk), .. }]
        ));
        assert!(pending.is_empty());

        let sent: usize = peers.iter().map(|p| p.sent().len()).sum();
        assert_eq!(sent, 1 + MAX_RETRIES as usize);
    }

    #[test]
    fn test_stale_id_after_retry_is_unknown() {
        let (info, peers) = peers_with(&["a"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let id = pending
            .submit(&info, any_candidate(), snap_factory(), Duration::ZERO)
            .unwrap();
        pending.sweep_expired(&info, TIMEOUT);

        let late = SyncMessage::SnapResponse {
            id,
            kind: SnapKind::StateChunk,
            payload: vec![],
        };
        assert_eq!(
            pending.on_response(&peers[0].id(), &late).err(),
            Some(ResponseRejection::UnknownId(id))
        );
    }

    #[test]
    fn test_clear_retryable_keeps_one_shot_requests() {
        let (info, peers) = peers_with(&["a"]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let one_shot = pending
            .send(&info, &peers[0].id(), |id| SyncMessage::BlockHashRequest { id, height: 1 }, Duration::ZERO)
            .unwrap();
        pending
            .submit(&info, any_candidate(), snap_factory(), Duration::ZERO)
            .unwrap();

        pending.clear_retryable();
        assert_eq!(pending.len(), 1);
        assert!(pending.is_pending(one_shot));
    }

    #[test]
    fn test_unknown_peer_is_an_error() {
        let (info, _) = peers_with(&[]);
        let mut pending = PendingRequests::new(TIMEOUT, 16);
        let stranger = PeerId::from_label("stranger");
        assert_eq!(
            pending.send(&info, &stranger, |id| SyncMessage::BlockHashRequest { id, height: 1 }, Duration::ZERO),
            Err(SyncError::UnknownPeer(stranger))
        );
        assert_eq!(
            pending.submit(&info, any_candidate(), snap_factory(), Duration::ZERO),
            Err(SyncError::NoPeerAvailable)
        );
    }

    #[test]
    fn test_full_table_refuses_instead_of_dropping() {
        let (info, peers) = peers_with(&["a", "b"]);
        let mut pending = PendingRequests::new(TIMEOUT, 1);
        let first = pending
            .submit(&info, any_candidate(), snap_factory(), Duration::ZERO)
            .unwrap();

        assert_eq!(
            pending.submit(&info, any_candidate(), snap_factory(), Duration::ZERO),
            Err(SyncError::TooManyPendingRequests(1))
        );
        assert_eq!(
            pending.send(&info, &peers[0].id(), |id| SyncMessage::BlockHashRequest { id, height: 1 }, Duration::ZERO),
            Err(SyncError::TooManyPendingRequests(1))
        );
        assert!(pending.is_pending(first));

        // the request that was kept still runs its full retry course
        let mut now = Duration::ZERO;
        let mut outcomes = Vec::new();
        for _ in 0..=MAX_RETRIES {
            now += TIMEOUT;
            outcomes.extend(pending.sweep_expired(&info, now));
        }
        assert!(matches!(outcomes[0], SweepOutcome::Retried { previous_id, .. } if previous_id == first));
        assert!(matches!(outcomes.last(), Some(SweepOutcome::Exhausted { .. })));
        assert_eq!(outcomes.len(), 1 + MAX_RETRIES as usize);
        assert!(pending.is_empty());
    }
}
