use chainsync_core::{BlockBody, BlockDifficulty, BlockHeader, BlockIdentifier, Hash256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain summary a peer advertises about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub best_block_number: u64,
    pub best_block_hash: Hash256,
    pub total_difficulty: BlockDifficulty,
}

impl Status {
    pub fn new(best_block_number: u64, best_block_hash: Hash256, total_difficulty: BlockDifficulty) -> Self {
        Self {
            best_block_number,
            best_block_hash,
            total_difficulty,
        }
    }
}

/// Snapshot exchange sub-protocol. Payload bytes are opaque to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapKind {
    Status,
    Blocks,
    StateChunk,
}

/// Messages exchanged by the sync protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    Status(Status),

    /// Ask for `count` headers ending at `hash`, walking toward genesis
    BlockHeadersRequest { id: u64, hash: Hash256, count: u32 },
    /// Headers newest-first
    BlockHeadersResponse { id: u64, headers: Vec<BlockHeader> },

    /// Ask for the hash of the peer's canonical block at a height
    BlockHashRequest { id: u64, height: u64 },
    BlockHashResponse { id: u64, hash: Hash256 },

    /// Ask for checkpoints spaced one chunk apart, starting at or below `start_number`
    SkeletonRequest { id: u64, start_number: u64 },
    SkeletonResponse { id: u64, block_identifiers: Vec<BlockIdentifier> },

    BodyRequest { id: u64, hash: Hash256 },
    BodyResponse { id: u64, body: BlockBody },

    SnapRequest { id: u64, kind: SnapKind, payload: Vec<u8> },
    SnapResponse { id: u64, kind: SnapKind, payload: Vec<u8> },
}

/// Variant tag of a [`SyncMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Status,
    BlockHeadersRequest,
    BlockHeadersResponse,
    BlockHashRequest,
    BlockHashResponse,
    SkeletonRequest,
    SkeletonResponse,
    BodyRequest,
    BodyResponse,
    SnapRequest(SnapKind),
    SnapResponse(SnapKind),
}

impl MessageType {
    /// Type of the answer a request expects, `None` for non-requests
    pub fn expected_response(&self) -> Option<MessageType> {
        match self {
            MessageType::BlockHeadersRequest => Some(MessageType::BlockHeadersResponse),
            MessageType::BlockHashRequest => Some(MessageType::BlockHashResponse),
            MessageType::SkeletonRequest => Some(MessageType::SkeletonResponse),
            MessageType::BodyRequest => Some(MessageType::BodyResponse),
            MessageType::SnapRequest(kind) => Some(MessageType::SnapResponse(*kind)),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::BlockHeadersResponse
                | MessageType::BlockHashResponse
                | MessageType::SkeletonResponse
                | MessageType::BodyResponse
                | MessageType::SnapResponse(_)
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::SnapRequest(kind) => write!(f, "SnapRequest({:?})", kind),
            MessageType::SnapResponse(kind) => write!(f, "SnapResponse({:?})", kind),
            other => write!(f, "{:?}", other),
        }
    }
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::Status(_) => MessageType::Status,
            SyncMessage::BlockHeadersRequest { .. } => MessageType::BlockHeadersRequest,
            SyncMessage::BlockHeadersResponse { .. } => MessageType::BlockHeadersResponse,
            SyncMessage::BlockHashRequest { .. } => MessageType::BlockHashRequest,
            SyncMessage::BlockHashResponse { .. } => MessageType::BlockHashResponse,
            SyncMessage::SkeletonRequest { .. } => MessageType::SkeletonRequest,
            SyncMessage::SkeletonResponse { .. } => MessageType::SkeletonResponse,
            SyncMessage::BodyRequest { .. } => MessageType::BodyRequest,
            SyncMessage::BodyResponse { .. } => MessageType::BodyResponse,
            SyncMessage::SnapRequest { kind, .. } => MessageType::SnapRequest(*kind),
            SyncMessage::SnapResponse { kind, .. } => MessageType::SnapResponse(*kind),
        }
    }

    /// Correlation id, absent only on status announcements
    pub fn id(&self) -> Option<u64> {
        match self {
            SyncMessage::Status(_) => None,
            SyncMessage::BlockHeadersRequest { id, .. }
            | SyncMessage::BlockHeadersResponse { id, .. }
            | SyncMessage::BlockHashRequest { id, .. }
            | SyncMessage::BlockHashResponse { id, .. }
            | SyncMessage::SkeletonRequest { id, .. }
            | SyncMessage::SkeletonResponse { id, .. }
            | SyncMessage::BodyRequest { id, .. }
            | SyncMessage::BodyResponse { id, .. }
            | SyncMessage::SnapRequest { id, .. }
            | SyncMessage::SnapResponse { id, .. } => Some(*id),
        }
    }
}
