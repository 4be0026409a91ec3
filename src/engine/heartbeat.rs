use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;

/// Tracks the pong side of the keepalive. The engine's run loop sends the
/// pings; this only remembers when the client last answered.
pub(crate) struct Heartbeat {
    last_pong: AtomicCell<Instant>,
    interval: Duration,
    miss: u32,
}

impl Heartbeat {
    pub(crate) fn new(interval: Duration, miss: u32) -> Heartbeat {
        Self {
            last_pong: AtomicCell::new(Instant::now()),
            interval,
            miss,
        }
    }
    pub(crate) fn pong(&self) {
        self.last_pong.store(Instant::now());
    }
    pub(crate) fn expired(&self) -> bool {
        self.last_pong.load().elapsed() > self.interval * self.miss
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::engine::heartbeat::Heartbeat;

    #[test]
    fn test_expiry() {
        let heartbeat = Heartbeat::new(Duration::from_millis(10), 2);
        assert!(!heartbeat.expired());
        std::thread::sleep(Duration::from_millis(30));
        assert!(heartbeat.expired());
        heartbeat.pong();
        assert!(!heartbeat.expired());
    }
}
