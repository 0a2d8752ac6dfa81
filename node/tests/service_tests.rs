//! Sync Service Tests
//!
//! The async actor end to end: peers talk to it through its handle and it
//! hands the processor back on shutdown.

mod common;

use common::{config, DIFFICULTY};
use node::network::responder::ChainResponder;
use node::network::sync::{PeerScoreBoard, SyncError, SyncProcessor, SyncService, SyncValidationRules};
use node::network::{ChannelPeer, NetworkCommand, PeerId, PeerRef, SyncMessage};
use node::simulation::{build_chain, store_from_chain, sync_over_service};
use node::storage::{BlockStore, MemoryBlockStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_fresh_node_syncs_through_the_service() {
    let chain = build_chain(1000, DIFFICULTY);
    let source: Arc<dyn BlockStore> = Arc::new(store_from_chain(&chain, 0, 1000).unwrap());

    let stats = sync_over_service(config(), source, chain[0].clone(), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(stats.best_block_number, 1000);
    assert_eq!(stats.state, "PeerAndModeDeciding");
    assert_eq!(stats.known_peers, 1);
}

#[tokio::test]
async fn test_requests_go_out_through_the_peer_channel() {
    let chain = build_chain(50, DIFFICULTY);
    let local: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::with_genesis(&chain[0]));
    let processor = SyncProcessor::new(
        config(),
        local,
        chain[0].clone(),
        Arc::new(PeerScoreBoard::new()),
        SyncValidationRules::default(),
    );
    let (service, handle) = SyncService::new(processor, Duration::from_millis(10));
    let task = service.spawn();

    let remote = Arc::new(store_from_chain(&chain, 0, 50).unwrap());
    let status = ChainResponder::new(remote, 192).status().unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let peer: PeerRef = Arc::new(ChannelPeer::new(PeerId::from_label("remote"), tx));
    handle.peer_status(peer, status).await.unwrap();

    let Some(NetworkCommand::SendToPeer { peer_id, message }) = rx.recv().await else {
        panic!("expected an outbound request");
    };
    assert_eq!(peer_id, PeerId::from_label("remote"));
    assert!(matches!(message, SyncMessage::BlockHeadersRequest { count: 1, .. }));

    let stats = handle.stats().await.unwrap();
    assert!(stats.syncing);
    assert_eq!(stats.pending_requests, 1);

    handle.abort_sync().await.unwrap();
    assert!(!handle.stats().await.unwrap().syncing);

    handle.shutdown().await.unwrap();
    let processor = task.await.unwrap();
    assert_eq!(processor.state_name(), "PeerAndModeDeciding");
    assert_eq!(handle.stats().await, Err(SyncError::ServiceStopped));
}
