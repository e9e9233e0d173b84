//! The server clock.

use parking_lot::Mutex;
use rlsync_protocol::timestamp::now_millis;

/// Resolution of server timestamps. Wire timestamps carry two decimal places.
const TICK: i64 = 10;

/// Issues server timestamps in hundredths of a second.
///
/// Every write timestamp is strictly greater than any timestamp handed out
/// before it, so a client that syncs `newer` than a reported server time
/// never misses a later write.
#[derive(Debug, Default)]
pub struct ServerClock {
    last: Mutex<i64>,
}

impl ServerClock {
    /// Creates a clock.
    pub fn new() -> Self {
        Self::default()
    }

    fn wall() -> i64 {
        now_millis() / TICK * TICK
    }

    /// Returns the current server time, for response headers.
    pub fn now(&self) -> i64 {
        let mut last = self.last.lock();
        *last = (*last).max(Self::wall());
        *last
    }

    /// Returns a fresh timestamp for a write.
    pub fn tick(&self) -> i64 {
        let mut last = self.last.lock();
        *last = Self::wall().max(*last + TICK);
        *last
    }
}
