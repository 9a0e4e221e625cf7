//! StreamSupervisor - Lifecycle of one transport session
//!
//! ## Responsibilities
//!
//! - Drive a `SupervisedTransport` (producer or consumer side) while live
//! - Watchdog: detect a silent transport (producer) or rely on the
//!   transport's own connection-loss signal (consumer)
//! - Recovery loop: close, wait `retry_delay`, reopen, settle, check again
//! - Ordered stop: mark closing, cancel the transport loop and watchdog, close
//!
//! ## States
//!
//! `Connecting -> Live -> StaleDetected -> Recovering -> Live | Terminated`
//!
//! Transient (transport) errors always lead to recovery and never end the
//! session. Any other error ends it as fatal.
//!
//! The transport loop, the watchdog and the settle timer are polled from the
//! same task, so by the time teardown runs the previous loop is gone.

mod heartbeat;
mod retry;

pub use heartbeat::Heartbeat;
pub use retry::{RetryDelay, DEFAULT_RETRY_CAP_SECS};

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

/// Transport driven by a supervisor
#[async_trait]
pub trait SupervisedTransport: Send {
    /// Build transport resources from scratch
    async fn open(&mut self) -> Result<()>;

    /// Run the event loop, beating `heartbeat` on every successful send/receive.
    ///
    /// `Ok(())` means the source ended on its own. May be cancelled at any
    /// await point; `close` is always called afterwards.
    async fn drive(&mut self, heartbeat: &Heartbeat) -> Result<()>;

    /// Release transport resources. Must tolerate being called when not open.
    async fn close(&mut self) -> Result<()>;

    /// Called after a successful reopen, before the new loop starts
    fn mark_recovering(&mut self) {}
}

/// How staleness is detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogPolicy {
    /// Poll time since the last heartbeat
    Poll {
        grace: Duration,
        interval: Duration,
        stale_after: Duration,
    },
    /// The transport reports connection loss itself
    ConnectionSignal,
}

/// Supervisor tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grace_secs: u64,
    pub poll_interval_secs: u64,
    pub producer_stale_secs: u64,
    pub settle_secs: u64,
    pub retry_cap_secs: u64,
    /// Check interval for restarting streams that ended on a fatal error
    pub fatal_restart_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_secs: 30,
            poll_interval_secs: 5,
            producer_stale_secs: 120,
            settle_secs: 10,
            retry_cap_secs: DEFAULT_RETRY_CAP_SECS,
            fatal_restart_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn producer_policy(&self) -> WatchdogPolicy {
        WatchdogPolicy::Poll {
            grace: Duration::from_secs(self.grace_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
            stale_after: Duration::from_secs(self.producer_stale_secs),
        }
    }

    pub fn consumer_policy(&self) -> WatchdogPolicy {
        WatchdogPolicy::ConnectionSignal
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn fatal_restart(&self) -> Duration {
        Duration::from_secs(self.fatal_restart_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Validation("supervisor poll_interval_secs must be > 0".into()));
        }
        if self.producer_stale_secs == 0 {
            return Err(Error::Validation("supervisor producer_stale_secs must be > 0".into()));
        }
        if self.fatal_restart_secs == 0 {
            return Err(Error::Validation("supervisor fatal_restart_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Connecting,
    Live,
    StaleDetected,
    Recovering,
    Closing,
    Terminated,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    Completed,
    Fatal,
}

/// Published supervisor status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub retry_delay_secs: u64,
    pub recoveries: u64,
    pub last_error: Option<String>,
    pub end: Option<EndReason>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Connecting,
            retry_delay_secs: 0,
            recoveries: 0,
            last_error: None,
            end: None,
        }
    }
}

#[derive(Debug)]
pub enum SessionEnd {
    Stopped,
    Completed,
    Fatal(Error),
}

impl SessionEnd {
    pub fn reason(&self) -> EndReason {
        match self {
            SessionEnd::Stopped => EndReason::Stopped,
            SessionEnd::Completed => EndReason::Completed,
            SessionEnd::Fatal(_) => EndReason::Fatal,
        }
    }
}

/// Final result of `StreamSupervisor::run`
pub struct SupervisorExit<T> {
    pub end: SessionEnd,
    pub transport: T,
}

enum LiveExit {
    Stale,
    SettleFailed,
    /// `unproven`: lost after a reopen, before the first beat
    Transport { error: Error, unproven: bool },
    Completed,
    Stop,
}

enum RecoverExit {
    Reopened,
    Stop,
    Fatal(Error),
}

pub struct StreamSupervisor<T> {
    stream_id: String,
    side: &'static str,
    transport: T,
    policy: WatchdogPolicy,
    settle: Duration,
    retry: RetryDelay,
    heartbeat: Arc<Heartbeat>,
    status: watch::Sender<SupervisorStatus>,
}

impl<T: SupervisedTransport> StreamSupervisor<T> {
    pub fn new(
        stream_id: impl Into<String>,
        side: &'static str,
        transport: T,
        policy: WatchdogPolicy,
        config: &SupervisorConfig,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            stream_id: stream_id.into(),
            side,
            transport,
            policy,
            settle: config.settle(),
            retry: RetryDelay::new(config.retry_cap_secs),
            heartbeat: Arc::new(Heartbeat::new()),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    /// Run until stopped, completed or failed fatally. The transport is
    /// always closed before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit<T> {
        let end = self.run_session(&mut shutdown).await;

        self.set_state(SupervisorState::Closing);
        if let Err(e) = self.transport.close().await {
            warn!(stream_id = %self.stream_id, side = self.side, error = %e, "Transport close failed");
        }

        match &end {
            SessionEnd::Stopped => {
                info!(stream_id = %self.stream_id, side = self.side, "Session stopped");
            }
            SessionEnd::Completed => {
                info!(stream_id = %self.stream_id, side = self.side, "Source ended, session complete");
            }
            SessionEnd::Fatal(e) => {
                error!(stream_id = %self.stream_id, side = self.side, error = %e, "Session terminated on fatal error");
            }
        }

        let reason = end.reason();
        let fatal_msg = match &end {
            SessionEnd::Fatal(e) => Some(e.to_string()),
            _ => None,
        };
        self.status.send_modify(|s| {
            s.state = SupervisorState::Terminated;
            s.end = Some(reason);
            if fatal_msg.is_some() {
                s.last_error = fatal_msg;
            }
        });

        SupervisorExit {
            end,
            transport: self.transport,
        }
    }

    async fn run_session(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        if *shutdown.borrow() {
            return SessionEnd::Stopped;
        }

        self.set_state(SupervisorState::Connecting);
        let mut needs_recovery = match self.transport.open().await {
            Ok(()) => {
                self.heartbeat.rearm();
                false
            }
            Err(e) if e.is_transient() => {
                warn!(stream_id = %self.stream_id, side = self.side, error = %e, "Initial connect failed");
                self.record_error(&e);
                true
            }
            Err(e) => return SessionEnd::Fatal(e),
        };

        loop {
            let settling = if needs_recovery {
                match self.recover(shutdown).await {
                    RecoverExit::Reopened => true,
                    RecoverExit::Stop => return SessionEnd::Stopped,
                    RecoverExit::Fatal(e) => return SessionEnd::Fatal(e),
                }
            } else {
                self.set_state(SupervisorState::Live);
                false
            };

            match self.live(shutdown, settling).await {
                LiveExit::Stale => {
                    warn!(
                        stream_id = %self.stream_id,
                        side = self.side,
                        idle_secs = self.heartbeat.elapsed().as_secs(),
                        "Stream stale, restarting"
                    );
                    self.set_state(SupervisorState::StaleDetected);
                }
                LiveExit::SettleFailed => {
                    self.retry.fail();
                    warn!(
                        stream_id = %self.stream_id,
                        side = self.side,
                        next_delay_secs = self.retry.secs(),
                        "Recovery did not settle"
                    );
                }
                LiveExit::Transport { error, unproven } if error.is_transient() => {
                    if unproven {
                        self.retry.fail();
                    }
                    warn!(
                        stream_id = %self.stream_id,
                        side = self.side,
                        error = %error,
                        next_delay_secs = self.retry.secs(),
                        "Transport lost"
                    );
                    self.record_error(&error);
                }
                LiveExit::Transport { error, .. } => return SessionEnd::Fatal(error),
                LiveExit::Completed => return SessionEnd::Completed,
                LiveExit::Stop => return SessionEnd::Stopped,
            }
            needs_recovery = true;
        }
    }

    /// Close, wait, reopen until a reopen succeeds. Never gives up.
    async fn recover(&mut self, shutdown: &mut watch::Receiver<bool>) -> RecoverExit {
        loop {
            self.status.send_modify(|s| {
                s.state = SupervisorState::Recovering;
                s.recoveries += 1;
            });

            if let Err(e) = self.transport.close().await {
                warn!(stream_id = %self.stream_id, side = self.side, error = %e, "Close before recovery failed");
            }

            let delay = self.retry.duration();
            self.publish_delay();
            info!(
                stream_id = %self.stream_id,
                side = self.side,
                delay_secs = delay.as_secs(),
                "Attempting recovery"
            );

            let nap = sleep(delay);
            tokio::pin!(nap);
            loop {
                tokio::select! {
                    _ = &mut nap => break,
                    stop = wait_for_stop(shutdown) => {
                        if stop {
                            return RecoverExit::Stop;
                        }
                    }
                }
            }

            match self.transport.open().await {
                Ok(()) => {
                    self.heartbeat.rearm();
                    self.transport.mark_recovering();
                    return RecoverExit::Reopened;
                }
                Err(e) if e.is_transient() => {
                    self.retry.fail();
                    warn!(
                        stream_id = %self.stream_id,
                        side = self.side,
                        error = %e,
                        next_delay_secs = self.retry.secs(),
                        "Reconnect failed"
                    );
                    self.record_error(&e);
                }
                Err(e) => return RecoverExit::Fatal(e),
            }
        }
    }

    /// Live loop. After a reopen (`settling`) the session is unproven until
    /// its first beat, which resets the retry delay. A polled transport that
    /// has not beaten by the end of the settle period fails the recovery.
    async fn live(&mut self, shutdown: &mut watch::Receiver<bool>, settling: bool) -> LiveExit {
        let heartbeat = self.heartbeat.clone();
        let beats_before = heartbeat.beats();
        let policy = self.policy.clone();

        let drive = self.transport.drive(&heartbeat);
        tokio::pin!(drive);
        let watchdog = watchdog(&policy, &heartbeat);
        tokio::pin!(watchdog);
        let settle = sleep(self.settle);
        tokio::pin!(settle);
        let first_beat = heartbeat.beaten_since(beats_before);
        tokio::pin!(first_beat);
        let mut unproven = settling;
        let mut settle_pending = settling;

        loop {
            tokio::select! {
                res = &mut drive => {
                    return match res {
                        Ok(()) => LiveExit::Completed,
                        Err(error) => LiveExit::Transport { error, unproven },
                    };
                }
                _ = &mut watchdog => return LiveExit::Stale,
                _ = &mut first_beat, if unproven => {
                    unproven = false;
                    settle_pending = false;
                    self.retry.reset();
                    self.status.send_modify(|s| {
                        s.state = SupervisorState::Live;
                        s.retry_delay_secs = 0;
                    });
                    info!(stream_id = %self.stream_id, side = self.side, "Recovered");
                }
                _ = &mut settle, if settle_pending => {
                    settle_pending = false;
                    if heartbeat.beats() > beats_before {
                        // first_beat is ready and runs next
                        continue;
                    }
                    match &policy {
                        WatchdogPolicy::Poll { .. } => return LiveExit::SettleFailed,
                        WatchdogPolicy::ConnectionSignal => {
                            // Connection held; the delay resets on the first receive
                            self.status.send_modify(|s| s.state = SupervisorState::Live);
                            info!(
                                stream_id = %self.stream_id,
                                side = self.side,
                                retry_delay_secs = self.retry.secs(),
                                "Reconnected, waiting for first message"
                            );
                        }
                    }
                }
                stop = wait_for_stop(shutdown) => {
                    if stop {
                        return LiveExit::Stop;
                    }
                }
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn publish_delay(&self) {
        let secs = self.retry.secs();
        self.status.send_modify(|s| s.retry_delay_secs = secs);
    }

    fn record_error(&self, e: &Error) {
        let msg = e.to_string();
        self.status.send_modify(|s| s.last_error = Some(msg));
    }
}

/// Resolves when the shutdown flag changes. `true` means stop; a dropped
/// sender also counts as stop.
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) -> bool {
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}

/// Resolves once the heartbeat is stale. Never resolves for `ConnectionSignal`.
async fn watchdog(policy: &WatchdogPolicy, heartbeat: &Heartbeat) {
    match policy {
        WatchdogPolicy::Poll {
            grace,
            interval: period,
            stale_after,
        } => {
            sleep(*grace).await;
            let mut ticker = interval(*period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if heartbeat.elapsed() > *stale_after {
                    return;
                }
            }
        }
        WatchdogPolicy::ConnectionSignal => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Clone, Copy)]
    enum Script {
        Beat(Duration),
        Stall,
        FailAfter(Duration, bool),
        /// One beat, then a transient failure
        BeatThenFail(Duration, Duration),
        Complete,
    }

    #[derive(Clone, Default)]
    struct Log {
        events: Arc<Mutex<Vec<&'static str>>>,
        opens: Arc<Mutex<Vec<Instant>>>,
    }

    impl Log {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
        fn open_gaps(&self) -> Vec<u64> {
            let opens = self.opens.lock().unwrap();
            opens.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect()
        }
    }

    struct FakeTransport {
        failing_opens: usize,
        sessions: VecDeque<Script>,
        current: Script,
        log: Log,
    }

    impl FakeTransport {
        fn new(failing_opens: usize, sessions: Vec<Script>, log: Log) -> Self {
            Self {
                failing_opens,
                sessions: sessions.into(),
                current: Script::Stall,
                log,
            }
        }
    }

    #[async_trait]
    impl SupervisedTransport for FakeTransport {
        async fn open(&mut self) -> Result<()> {
            self.log.opens.lock().unwrap().push(Instant::now());
            self.log.events.lock().unwrap().push("open");
            if self.failing_opens > 0 {
                self.failing_opens -= 1;
                return Err(Error::Transport("refused".into()));
            }
            self.current = self.sessions.pop_front().unwrap_or(Script::Beat(Duration::from_secs(1)));
            Ok(())
        }

        async fn drive(&mut self, heartbeat: &Heartbeat) -> Result<()> {
            match self.current {
                Script::Beat(every) => loop {
                    sleep(every).await;
                    heartbeat.beat();
                },
                Script::Stall => std::future::pending().await,
                Script::FailAfter(after, transient) => {
                    sleep(after).await;
                    if transient {
                        Err(Error::Transport("connection reset".into()))
                    } else {
                        Err(Error::Internal("corrupt state".into()))
                    }
                }
                Script::BeatThenFail(beat_after, fail_after) => {
                    sleep(beat_after).await;
                    heartbeat.beat();
                    sleep(fail_after - beat_after).await;
                    Err(Error::Transport("connection reset".into()))
                }
                Script::Complete => Ok(()),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.log.events.lock().unwrap().push("close");
            Ok(())
        }

        fn mark_recovering(&mut self) {
            self.log.events.lock().unwrap().push("recovering");
        }
    }

    fn supervisor(
        transport: FakeTransport,
        policy: WatchdogPolicy,
    ) -> StreamSupervisor<FakeTransport> {
        StreamSupervisor::new("CAM-T", "producer", transport, policy, &SupervisorConfig::default())
    }

    async fn wait_live_after(rx: &mut watch::Receiver<SupervisorStatus>, recoveries: u64) {
        rx.wait_for(|s| s.state == SupervisorState::Live && s.recoveries >= recoveries)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_sequence_and_reset() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(33, vec![], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 1).await;
        assert_eq!(status.borrow().retry_delay_secs, 0);

        let expected: Vec<u64> = (0..33u64).map(|i| i.min(30)).collect();
        assert_eq!(log.open_gaps(), expected);

        stop_tx.send(true).unwrap();
        let exit = task.await.unwrap();
        assert!(matches!(exit.end, SessionEnd::Stopped));
        assert_eq!(status.borrow().state, SupervisorState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_stale_after_120s() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(0, vec![Script::Stall], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 1).await;
        // grace 30s, then 5s polls; first poll past 120s idle is at 125s
        assert_eq!(log.open_gaps(), vec![125]);
        assert!(log.events().contains(&"recovering"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_recovery_increments_delay() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(
                0,
                vec![
                    Script::FailAfter(Duration::from_secs(1), true),
                    Script::Stall,
                    Script::Beat(Duration::from_secs(1)),
                ],
                log.clone(),
            ),
            SupervisorConfig::default().producer_policy(),
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 2).await;
        // fail at 1s, reopen after 0s; no beats for 10s settle; reopen after 1s
        assert_eq!(log.open_gaps(), vec![1, 11]);
        assert_eq!(status.borrow().retry_delay_secs, 0);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_receive_after_reopen_resets_delay() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(
                3,
                vec![
                    Script::BeatThenFail(Duration::from_secs(1), Duration::from_secs(3)),
                    Script::Stall,
                ],
                log.clone(),
            ),
            WatchdogPolicy::ConnectionSignal,
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 4).await;
        // delay climbs to 2 over refused opens; the receive at +1s resets it,
        // so the drop at +3s reopens without waiting
        assert_eq!(log.open_gaps(), vec![0, 1, 2, 3]);
        assert_eq!(status.borrow().retry_delay_secs, 0);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_consumer_keeps_delay_until_first_receive() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(
                3,
                vec![Script::FailAfter(Duration::from_secs(15), true), Script::Stall],
                log.clone(),
            ),
            WatchdogPolicy::ConnectionSignal,
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 3).await;
        assert_eq!(status.borrow().retry_delay_secs, 2);

        wait_live_after(&mut status, 4).await;
        // nothing received before the drop at 15s, so the delay grew to 3
        assert_eq!(log.open_gaps(), vec![0, 1, 2, 18]);
        assert_eq!(status.borrow().retry_delay_secs, 3);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_waits_for_connection_signal() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(
                0,
                vec![Script::FailAfter(Duration::from_secs(2), true), Script::Stall],
                log.clone(),
            ),
            WatchdogPolicy::ConnectionSignal,
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        wait_live_after(&mut status, 1).await;
        // A silent but connected consumer is not stale
        tokio::time::sleep(Duration::from_secs(1_000)).await;
        assert_eq!(status.borrow().state, SupervisorState::Live);
        assert_eq!(log.opens.lock().unwrap().len(), 2);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(
            log.events(),
            vec!["open", "close", "open", "recovering", "close"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_terminates() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(0, vec![Script::FailAfter(Duration::from_secs(3), false)], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let status = sup.subscribe();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let exit = sup.run(stop_rx).await;
        assert!(matches!(exit.end, SessionEnd::Fatal(Error::Internal(_))));
        assert_eq!(log.events(), vec!["open", "close"]);
        let status = status.borrow();
        assert_eq!(status.end, Some(EndReason::Fatal));
        assert!(status.last_error.as_deref().unwrap_or("").contains("corrupt state"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_source() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(0, vec![Script::Complete], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = sup.run(stop_rx).await;
        assert!(matches!(exit.end, SessionEnd::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(usize::MAX, vec![], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let mut status = sup.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sup.run(stop_rx));

        status.wait_for(|s| s.retry_delay_secs >= 5).await.unwrap();
        stop_tx.send(true).unwrap();
        let exit = task.await.unwrap();
        assert!(matches!(exit.end, SessionEnd::Stopped));
        assert_eq!(log.events().last(), Some(&"close"));
    }

    #[tokio::test]
    async fn test_already_stopped() {
        let log = Log::default();
        let sup = supervisor(
            FakeTransport::new(0, vec![], log.clone()),
            SupervisorConfig::default().producer_policy(),
        );
        let (_stop_tx, stop_rx) = watch::channel(true);
        let exit = sup.run(stop_rx).await;
        assert!(matches!(exit.end, SessionEnd::Stopped));
        assert_eq!(log.events(), vec!["close"]);
    }
}
