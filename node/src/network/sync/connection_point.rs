//! Binary search for the highest height shared with a peer

/// Outcome of the connection point search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPoint {
    NotFound,
    Found(u64),
}

impl ConnectionPoint {
    pub fn height(&self) -> Option<u64> {
        match self {
            ConnectionPoint::NotFound => None,
            ConnectionPoint::Found(height) => Some(*height),
        }
    }
}

/// Narrows `[start, end)` until a single height is left.
///
/// Invariant: `start <= end`, the window only ever shrinks, and every height
/// at or below `start` is shared with the peer.
#[derive(Debug, Clone)]
pub struct ConnectionPointFinder {
    start: u64,
    end: u64,
    connection_point: ConnectionPoint,
}

impl ConnectionPointFinder {
    /// Open the window `[0, peer_best_height)`
    pub fn new(peer_best_height: u64) -> Self {
        let mut finder = Self {
            start: 0,
            end: peer_best_height,
            connection_point: ConnectionPoint::NotFound,
        };
        finder.try_settle();
        finder
    }

    /// Height to probe next
    pub fn current_height(&self) -> u64 {
        self.start + (self.end - self.start) / 2
    }

    /// The peer shares history up to the probed height
    pub fn found(&mut self) {
        if self.is_settled() {
            return;
        }
        self.start = self.current_height();
        self.try_settle();
    }

    /// The peer diverges at or below the probed height
    pub fn not_found(&mut self) {
        if self.is_settled() {
            return;
        }
        self.end = self.current_height();
        self.try_settle();
    }

    pub fn connection_point(&self) -> ConnectionPoint {
        self.connection_point
    }

    pub fn window(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    fn is_settled(&self) -> bool {
        matches!(self.connection_point, ConnectionPoint::Found(_))
    }

    fn try_settle(&mut self) {
        if self.end.saturating_sub(self.start) <= 1 {
            self.connection_point = ConnectionPoint::Found(self.start);
        }
    }
}
