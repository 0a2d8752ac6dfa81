//! Answers sync requests from peers out of the local block store

use crate::network::message::{Status, SyncMessage};
use crate::storage::BlockStore;
use chainsync_core::hash::ZERO_HASH;
use std::sync::Arc;
use tracing::trace;

/// Upper bound on headers returned for one request
pub const MAX_HEADERS_PER_RESPONSE: u32 = 1024;

/// Upper bound on links in one skeleton
pub const MAX_SKELETON_LINKS: usize = 256;

#[derive(Clone)]
pub struct ChainResponder {
    store: Arc<dyn BlockStore>,
    chunk_size: u32,
}

impl ChainResponder {
    pub fn new(store: Arc<dyn BlockStore>, chunk_size: u32) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Status this node would announce
    pub fn status(&self) -> Option<Status> {
        let best = self.store.best_block()?;
        let total_difficulty = self.store.total_difficulty_for(&best.hash())?;
        Some(Status::new(best.number(), best.hash(), total_difficulty))
    }

    /// Response to a request, `None` for anything that is not a request we
    /// can serve
    pub fn respond(&self, request: &SyncMessage) -> Option<SyncMessage> {
        let response = match request {
            SyncMessage::BlockHashRequest { id, height } => SyncMessage::BlockHashResponse {
                id: *id,
                hash: self
                    .store
                    .get_by_number(*height)
                    .map(|b| b.hash())
                    .unwrap_or(ZERO_HASH),
            },
            SyncMessage::BlockHeadersRequest { id, hash, count } => {
                let count = (*count).min(MAX_HEADERS_PER_RESPONSE) as usize;
                let mut headers = Vec::with_capacity(count);
                let mut next = self.store.get_by_hash(hash);
                while let Some(block) = next {
                    if headers.len() == count {
                        break;
                    }
                    next = if block.is_genesis() {
                        None
                    } else {
                        self.store.get_by_hash(block.parent_hash())
                    };
                    headers.push(block.header().clone());
                }
                SyncMessage::BlockHeadersResponse { id: *id, headers }
            }
            SyncMessage::SkeletonRequest { id, start_number } => SyncMessage::SkeletonResponse {
                id: *id,
                block_identifiers: self.skeleton(*start_number),
            },
            SyncMessage::BodyRequest { id, hash } => {
                let block = self.store.get_by_hash(hash)?;
                SyncMessage::BodyResponse {
                    id: *id,
                    body: block.body().clone(),
                }
            }
            _ => return None,
        };
        trace!("Answering {} with {}", request.message_type(), response.message_type());
        Some(response)
    }

    /// Links one chunk apart from the chunk boundary at or below
    /// `start_number`, closed by the best block when it is in reach
    fn skeleton(&self, start_number: u64) -> Vec<chainsync_core::BlockIdentifier> {
        let Some(best) = self.store.best_block() else {
            return Vec::new();
        };
        let chunk = u64::from(self.chunk_size);
        let mut links = Vec::new();
        let mut height = start_number - start_number % chunk;
        while height < best.number() {
            if links.len() + 1 >= MAX_SKELETON_LINKS {
                return links;
            }
            match self.store.get_by_number(height) {
                Some(block) => links.push(block.header().identifier()),
                None => return links,
            }
            height += chunk;
        }
        links.push(best.header().identifier());
        links
    }
}
