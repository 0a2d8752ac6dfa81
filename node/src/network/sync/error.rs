use crate::network::message::MessageType;
use crate::network::peer::{NetworkError, PeerId};
use thiserror::Error;

/// Failures of the request layer and the sync service handle
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No peer available for request")]
    NoPeerAvailable,

    #[error("Peer {0} is not registered")]
    UnknownPeer(PeerId),

    #[error("{0} is not a request")]
    NotARequest(MessageType),

    #[error("Pending request table is full ({0} requests)")]
    TooManyPendingRequests(usize),

    #[error("Sync service stopped")]
    ServiceStopped,

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
