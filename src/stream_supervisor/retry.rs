//! Linear retry delay with a cap

use std::time::Duration;

/// Default cap in seconds
pub const DEFAULT_RETRY_CAP_SECS: u64 = 30;

/// Seconds to wait before the next recovery attempt.
///
/// Starts at 0, grows by one second per failed attempt up to the cap,
/// and drops back to 0 after a successful recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    current: u64,
    cap: u64,
}

impl RetryDelay {
    pub fn new(cap: u64) -> Self {
        Self { current: 0, cap }
    }

    pub fn secs(&self) -> u64 {
        self.current
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.current)
    }

    pub fn fail(&mut self) {
        self.current = (self.current + 1).min(self.cap);
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CAP_SECS)
    }
}
