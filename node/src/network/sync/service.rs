//! Async shell around the sync processor
//!
//! The processor itself is synchronous. This actor owns it, feeds it peer
//! events from a channel and drives its clock from a tokio interval, so
//! every event is handled to completion before the next one.

use super::error::SyncError;
use super::processor::{SyncProcessor, SyncStats};
use crate::network::message::{Status, SyncMessage};
use crate::network::peer::{PeerId, PeerRef};
use crate::network::responder::ChainResponder;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_QUEUE_SIZE: usize = 1024;

/// Inputs of the sync service
pub enum SyncEvent {
    PeerStatus { peer: PeerRef, status: Status },
    Message { peer: PeerRef, message: SyncMessage },
    PeerDisconnected(PeerId),
    AbortSync,
    Stats(oneshot::Sender<SyncStats>),
    Shutdown,
}

/// Cloneable sender side of the service
#[derive(Clone)]
pub struct SyncHandle {
    events: mpsc::Sender<SyncEvent>,
}

impl SyncHandle {
    async fn send(&self, event: SyncEvent) -> Result<(), SyncError> {
        self.events.send(event).await.map_err(|_| SyncError::ServiceStopped)
    }

    pub async fn peer_status(&self, peer: PeerRef, status: Status) -> Result<(), SyncError> {
        self.send(SyncEvent::PeerStatus { peer, status }).await
    }

    pub async fn message(&self, peer: PeerRef, message: SyncMessage) -> Result<(), SyncError> {
        self.send(SyncEvent::Message { peer, message }).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<(), SyncError> {
        self.send(SyncEvent::PeerDisconnected(peer)).await
    }

    pub async fn abort_sync(&self) -> Result<(), SyncError> {
        self.send(SyncEvent::AbortSync).await
    }

    pub async fn stats(&self) -> Result<SyncStats, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SyncEvent::Stats(tx)).await?;
        rx.await.map_err(|_| SyncError::ServiceStopped)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.send(SyncEvent::Shutdown).await
    }
}

pub struct SyncService {
    processor: SyncProcessor,
    events: mpsc::Receiver<SyncEvent>,
    tick_interval: Duration,
    responder: Option<ChainResponder>,
}

impl SyncService {
    pub fn new(processor: SyncProcessor, tick_interval: Duration) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let service = Self {
            processor,
            events: rx,
            tick_interval,
            responder: None,
        };
        (service, SyncHandle { events: tx })
    }

    /// Serve peers' requests from the local chain as well
    pub fn with_responder(mut self, responder: ChainResponder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn spawn(self) -> JoinHandle<SyncProcessor> {
        tokio::spawn(self.run())
    }

    /// Run until shut down or every handle is dropped, then hand the
    /// processor back
    pub async fn run(mut self) -> SyncProcessor {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();
        info!("Sync service started, ticking every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.processor.on_tick(now.duration_since(last_tick));
                    last_tick = now;
                }
                event = self.events.recv() => {
                    match event {
                        Some(SyncEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event),
                    }
                }
            }
        }

        info!("Sync service stopped in {}", self.processor.state_name());
        self.processor
    }

    fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::PeerStatus { peer, status } => self.processor.on_peer_status(peer, status),
            SyncEvent::Message { peer, message } => {
                if message.message_type().expected_response().is_some() {
                    self.serve(&peer, &message);
                } else {
                    self.processor.on_message(peer, message);
                }
            }
            SyncEvent::PeerDisconnected(peer) => self.processor.on_peer_disconnected(&peer),
            SyncEvent::AbortSync => self.processor.abort_sync(),
            SyncEvent::Stats(reply) => {
                if reply.send(self.processor.stats()).is_err() {
                    debug!("Stats requester went away");
                }
            }
            SyncEvent::Shutdown => {}
        }
    }

    fn serve(&self, peer: &PeerRef, request: &SyncMessage) {
        let Some(responder) = &self.responder else {
            debug!("No responder, dropping {} from {}", request.message_type(), peer.id());
            return;
        };
        if let Some(response) = responder.respond(request) {
            if let Err(e) = peer.send(response) {
                warn!("Failed to answer {}: {}", peer.id(), e);
            }
        }
    }
}
