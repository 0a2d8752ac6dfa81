pub mod config;
pub mod logging;
pub mod network;
pub mod simulation;
pub mod storage;

pub use crate::config::{NodeConfig, SyncConfig};
pub use crate::network::sync::{SyncError, SyncEvent, SyncHandle, SyncProcessor, SyncService, SyncStats};
pub use crate::network::{Peer, PeerId, PeerRef};
pub use crate::storage::{BlockStore, MemoryBlockStore, StorageError};
