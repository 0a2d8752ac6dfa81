//! Peer-facing side of the node: wire messages, peer handles, serving
//! requests, and block synchronization

pub mod message;
pub mod peer;
pub mod responder;
pub mod sync;

pub use message::{MessageType, SnapKind, Status, SyncMessage};
pub use peer::{ChannelPeer, NetworkCommand, NetworkError, Peer, PeerId, PeerRef};
pub use responder::ChainResponder;
pub use sync::{SyncHandle, SyncProcessor, SyncService, SyncStats};
