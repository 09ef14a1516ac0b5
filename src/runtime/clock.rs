//! Settle delays between actor steps, and wall-clock metadata.

use serde::{Deserialize, Serialize};

use std::time::{Duration, SystemTime};

/// Source of the waits a scenario uses to let the client and server catch up.
pub trait Clock {
    fn sleep(&mut self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn sleep(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Records requested sleeps without waiting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirtualClock {
    now_ms: u64,
    sleeps: u64,
}

impl VirtualClock {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn sleeps(&self) -> u64 {
        self.sleeps
    }

    pub fn advance(&mut self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        self.now_ms = self.now_ms.saturating_add(ms);
    }
}

impl Clock for VirtualClock {
    fn sleep(&mut self, d: Duration) {
        self.sleeps += 1;
        self.advance(d);
    }
}

pub fn wall_time_iso_utc() -> String {
    // Metadata only (startedAt/finishedAt).
    let now = SystemTime::now();
    let dt: time::OffsetDateTime = now.into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_counts_without_waiting() {
        let mut clock = VirtualClock::default();
        clock.sleep(Duration::from_secs(2));
        clock.sleep(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 2250);
        assert_eq!(clock.sleeps(), 2);
    }
}
