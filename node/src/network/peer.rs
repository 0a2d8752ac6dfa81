use super::message::SyncMessage;
use chainsync_core::hash::hash256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Node identity of a remote peer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Deterministic id derived from a label, handy for local wiring
    pub fn from_label(label: &str) -> Self {
        Self(hash256(label.as_bytes()))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        chainsync_core::hash::hex_to_hash(hex_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Outbound queue full for peer {0}")]
    QueueFull(PeerId),

    #[error("Connection to peer {0} closed")]
    ConnectionClosed(PeerId),

    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Commands emitted towards the transport layer
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    /// Send a message to a specific peer
    SendToPeer { peer_id: PeerId, message: SyncMessage },

    /// Disconnect from a peer
    DisconnectPeer(PeerId),
}

/// A remote node that can be asked for chain data
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    /// Queue one typed message for this peer
    fn send(&self, message: SyncMessage) -> Result<(), NetworkError>;

    /// Whether the peer serves snapshot state
    fn is_snap_capable(&self) -> bool {
        false
    }
}

pub type PeerRef = Arc<dyn Peer>;

/// Peer backed by the transport's command channel
#[derive(Clone)]
pub struct ChannelPeer {
    id: PeerId,
    commands: mpsc::Sender<NetworkCommand>,
    snap_capable: bool,
}

impl ChannelPeer {
    pub fn new(id: PeerId, commands: mpsc::Sender<NetworkCommand>) -> Self {
        Self {
            id,
            commands,
            snap_capable: false,
        }
    }

    pub fn with_snap_capability(mut self, snap_capable: bool) -> Self {
        self.snap_capable = snap_capable;
        self
    }
}

impl Peer for ChannelPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send(&self, message: SyncMessage) -> Result<(), NetworkError> {
        self.commands
            .try_send(NetworkCommand::SendToPeer {
                peer_id: self.id,
                message,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull(self.id),
                mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed(self.id),
            })
    }

    fn is_snap_capable(&self) -> bool {
        self.snap_capable
    }
}

impl fmt::Debug for ChannelPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPeer")
            .field("id", &self.id)
            .field("snap_capable", &self.snap_capable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::SyncMessage;

    #[tokio::test]
    async fn test_channel_peer_forwards_commands() {
        let (tx, mut rx) = mpsc::channel(1);
        let peer = ChannelPeer::new(PeerId::from_label("a"), tx);

        peer.send(SyncMessage::BlockHashRequest { id: 1, height: 5 }).unwrap();
        match rx.recv().await {
            Some(NetworkCommand::SendToPeer { peer_id, message }) => {
                assert_eq!(peer_id, PeerId::from_label("a"));
                assert_eq!(message.id(), Some(1));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_peer_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = ChannelPeer::new(PeerId::from_label("b"), tx);

        peer.send(SyncMessage::BlockHashRequest { id: 1, height: 5 }).unwrap();
        assert_eq!(
            peer.send(SyncMessage::BlockHashRequest { id: 2, height: 6 }),
            Err(NetworkError::QueueFull(PeerId::from_label("b")))
        );
    }

    #[test]
    fn test_peer_id_hex_round_trip() {
        let id = PeerId::from_label("node");
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
