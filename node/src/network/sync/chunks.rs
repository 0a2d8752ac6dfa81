//! Turns a skeleton into an ordered sequence of header chunks

use super::chunk::ChunkDescriptor;
use chainsync_core::BlockIdentifier;

/// Walks the skeleton links oldest-first. Link 0 is at or below the
/// connection point and is never requested.
#[derive(Debug, Clone)]
pub struct ChunksDownloadHelper {
    max_skeleton_chunks: usize,
    connection_point: u64,
    skeleton: Vec<BlockIdentifier>,
    last_requested_link_index: usize,
}

impl ChunksDownloadHelper {
    pub fn new(max_skeleton_chunks: usize, connection_point: u64, skeleton: Vec<BlockIdentifier>) -> Self {
        Self {
            max_skeleton_chunks,
            connection_point,
            skeleton,
            last_requested_link_index: 0,
        }
    }

    pub fn has_next_chunk(&self) -> bool {
        let link_index = self.last_requested_link_index + 1;
        link_index < self.skeleton.len() && link_index <= self.max_skeleton_chunks
    }

    pub fn next_chunk(&mut self) -> Option<ChunkDescriptor> {
        if !self.has_next_chunk() {
            return None;
        }
        let link_index = self.last_requested_link_index + 1;
        let link = &self.skeleton[link_index];
        let previous_known = self.skeleton[link_index - 1].number.max(self.connection_point);
        let count = link.number.saturating_sub(previous_known);

        self.last_requested_link_index = link_index;
        Some(ChunkDescriptor::new(link.hash, u32::try_from(count).unwrap_or(u32::MAX)))
    }

    /// Zero-based index of the chunk last handed out
    pub fn current_chunk_index(&self) -> Option<usize> {
        self.last_requested_link_index.checked_sub(1)
    }

    pub fn skeleton(&self) -> &[BlockIdentifier] {
        &self.skeleton
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn skeleton(numbers: &[u64]) -> Vec<BlockIdentifier> {
        numbers
            .iter()
            .map(|n| BlockIdentifier::new(*n, [*n as u8; 32]))
            .collect()
    }

    fn drain(helper: &mut ChunksDownloadHelper) -> Vec<ChunkDescriptor> {
        let mut chunks = Vec::new();
        while let Some(chunk) = helper.next_chunk() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_thousand_blocks_from_genesis() {
        let numbers = [0, 192, 384, 576, 768, 960, 1000];
        let mut helper = ChunksDownloadHelper::new(20, 0, skeleton(&numbers));

        let chunks = drain(&mut helper);
        let counts: Vec<u32> = chunks.iter().map(|c| c.count()).collect();
        assert_eq!(counts, vec![192, 192, 192, 192, 192, 40]);
        assert_eq!(counts.iter().map(|c| *c as u64).sum::<u64>(), 1000);
        assert_eq!(*chunks[5].hash(), [(1000u64 as u8); 32]);
        assert!(!helper.has_next_chunk());
    }

    #[test]
    fn test_first_chunk_starts_after_connection_point() {
        let mut helper = ChunksDownloadHelper::new(20, 250, skeleton(&[192, 384, 400]));

        assert_eq!(helper.next_chunk().map(|c| c.count()), Some(134));
        assert_eq!(helper.next_chunk().map(|c| c.count()), Some(16));
        assert_eq!(helper.current_chunk_index(), Some(1));
        assert_eq!(helper.next_chunk(), None);
    }

    #[test]
    fn test_link_budget_caps_consumption() {
        let numbers: Vec<u64> = (0..50).map(|i| i * 10).collect();
        let mut helper = ChunksDownloadHelper::new(3, 0, skeleton(&numbers));

        assert_eq!(drain(&mut helper).len(), 3);
    }

    #[test]
    fn test_single_link_skeleton_yields_nothing() {
        let helper = ChunksDownloadHelper::new(20, 0, skeleton(&[0]));
        assert!(!helper.has_next_chunk());
        assert_eq!(helper.current_chunk_index(), None);
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_the_range(
            cp in 0u64..5_000,
            stride in 1u64..300,
            extra in 1u64..5_000,
        ) {
            let start = cp - cp % stride;
            let best = cp + extra;
            let mut numbers: Vec<u64> = (0..).map(|i| start + i * stride).take_while(|n| *n < best).collect();
            numbers.push(best);
            prop_assume!(numbers.len() >= 2);

            let mut helper = ChunksDownloadHelper::new(usize::MAX, cp, skeleton(&numbers));
            let total: u64 = drain(&mut helper).iter().map(|c| c.count() as u64).sum();
            prop_assert_eq!(total, best - cp);
        }
    }
}
