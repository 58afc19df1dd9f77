use std::time::Duration;

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogEvent {
    pub armed_at_ms: u64,
    pub fired_at_ms: u64,
}

/// Deadline over the upload phase. Expiry is reported once by [`poll`].
///
/// [`poll`]: UploadWatchdog::poll
#[derive(Debug, Clone, Default)]
pub struct UploadWatchdog {
    armed: Option<(u64, u64)>,
}

impl UploadWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, timeout: Duration, now_ms: u64) {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.armed = Some((now_ms, now_ms.saturating_add(timeout_ms)));
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.armed.map(|(_, deadline)| deadline)
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<WatchdogEvent> {
        let (armed_at_ms, deadline_ms) = self.armed?;
        if now_ms < deadline_ms {
            return None;
        }

        self.armed = None;
        warn!(
            "upload watchdog fired after {} ms",
            now_ms.saturating_sub(armed_at_ms)
        );
        Some(WatchdogEvent {
            armed_at_ms,
            fired_at_ms: now_ms,
        })
    }
}
