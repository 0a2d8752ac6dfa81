use crate::network::message::Status;
use std::time::Duration;

/// Latest status a peer announced and when we last heard from it.
///
/// Times are readings of the sync driver's logical clock.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    status: Option<Status>,
    last_activity: Duration,
}

impl PeerStatus {
    pub fn new(now: Duration) -> Self {
        Self {
            status: None,
            last_activity: now,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Replace the announced status wholesale
    pub fn set_status(&mut self, status: Status, now: Duration) {
        self.status = Some(status);
        self.last_activity = now;
    }

    pub fn touch(&mut self, now: Duration) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Duration {
        self.last_activity
    }

    pub fn is_expired(&self, now: Duration, expiration: Duration) -> bool {
        now.saturating_sub(self.last_activity) > expiration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::BlockDifficulty;

    #[test]
    fn test_expiry_is_relative_to_last_activity() {
        let mut status = PeerStatus::new(Duration::from_secs(10));
        let window = Duration::from_secs(5);

        assert!(!status.is_expired(Duration::from_secs(15), window));
        assert!(status.is_expired(Duration::from_secs(16), window));

        status.set_status(Status::new(1, [1u8; 32], BlockDifficulty(3)), Duration::from_secs(16));
        assert!(!status.is_expired(Duration::from_secs(16), window));
        assert_eq!(status.status().map(|s| s.best_block_number), Some(1));
    }
}
