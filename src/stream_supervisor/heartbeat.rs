//! Last-successful-event clock shared by a transport and its watchdog

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
pub struct Heartbeat {
    last: Mutex<Instant>,
    beats: AtomicU64,
    beaten: Notify,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            beats: AtomicU64::new(0),
            beaten: Notify::new(),
        }
    }

    /// Record a successful send/receive
    pub fn beat(&self) {
        *self.lock() = Instant::now();
        self.beats.fetch_add(1, Ordering::SeqCst);
        self.beaten.notify_waiters();
    }

    /// Restart the clock without counting a beat (new transport session)
    pub fn rearm(&self) {
        *self.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed()
    }

    /// Lifetime beat count
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    /// Resolves once the beat count exceeds `before`
    pub async fn beaten_since(&self, before: u64) {
        loop {
            let notified = self.beaten.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.beats() > before {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_follows_beats() {
        let hb = Heartbeat::new();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(hb.elapsed(), Duration::from_secs(7));

        hb.beat();
        assert_eq!(hb.elapsed(), Duration::ZERO);
        assert_eq!(hb.beats(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        hb.rearm();
        assert_eq!(hb.beats(), 1);
        assert_eq!(hb.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beaten_since_wakes_on_next_beat() {
        let hb = std::sync::Arc::new(Heartbeat::new());
        hb.beat();

        // already past the mark
        hb.beaten_since(0).await;

        let waiter = {
            let hb = hb.clone();
            tokio::spawn(async move { hb.beaten_since(1).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        hb.beat();
        waiter.await.unwrap();
    }
}
