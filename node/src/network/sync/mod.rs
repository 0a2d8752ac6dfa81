//! Block synchronization
//!
//! A single-threaded state machine decides whether and how to catch up with
//! peers, downloads and validates the missing chain segment, and writes it
//! to the block store.

pub mod bounded_map;
pub mod chunk;
pub mod chunks;
pub mod connection_point;
pub mod error;
pub mod events;
pub mod peer_status;
pub mod peers;
pub mod processor;
pub mod requests;
pub mod scoring;
pub mod service;
pub mod snapshot;
pub mod states;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunk::ChunkDescriptor;
pub use connection_point::{ConnectionPoint, ConnectionPointFinder};
pub use error::SyncError;
pub use events::{Skeletons, SyncEventsHandler};
pub use peers::PeersInformation;
pub use processor::{SyncProcessor, SyncStats};
pub use requests::{PendingRequests, SweepOutcome, MAX_RETRIES};
pub use scoring::{EventType, PeerScoreBoard, ScoringSink};
pub use service::{SyncEvent, SyncHandle, SyncService};
pub use snapshot::{SnapOutcome, SnapSyncHandle, SnapshotProcessor};
pub use states::SyncState;
pub use validation::SyncValidationRules;
