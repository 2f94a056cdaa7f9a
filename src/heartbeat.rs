//! Periodic action runner with a stall watchdog.
//!
//! A heartbeat executes an async action on a fixed cadence and reports
//! failure transitions to a callback. The watchdog runs independently of the
//! action loop so a stalled action, not just a failing one, is detected and
//! reported within a bounded window.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Slack added on top of three missed intervals before the watchdog fires.
const WATCHDOG_OFFSET: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// The action completed with an error.
    #[error("heartbeat action failed: {0}")]
    Action(String),

    /// The action did not complete within the watchdog window.
    #[error("heartbeat stalled for {0:?}")]
    Timeout(Duration),
}

/// Handle to a running heartbeat. Dropping it stops both the action loop
/// and the watchdog.
#[derive(Debug)]
pub struct Heartbeat {
    shutdown: broadcast::Sender<()>,
}

impl Heartbeat {
    /// Run `action` every `interval_period`, reporting fault transitions
    /// through `on_failure`.
    ///
    /// `on_failure` is edge triggered: it receives `Some(err)` once when the
    /// heartbeat enters a failed state and `None` once when a later run
    /// succeeds again. Repeated failures in between are logged but not
    /// re-reported.
    pub fn spawn<A, F, E, R>(
        name: &'static str,
        interval_period: Duration,
        action: A,
        on_failure: R,
    ) -> Self
    where
        A: Fn() -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        R: Fn(Option<HeartbeatError>) + Send + Sync + 'static,
    {
        let (shutdown, _) = broadcast::channel::<()>(1);
        let faulted = Arc::new(AtomicBool::new(false));
        let on_failure = Arc::new(on_failure);

        // The action loop beats this channel on every completion, success or
        // not. The watchdog only cares that the action is still making
        // progress.
        let (beat_tx, beat_rx) = watch::channel(());

        let mut action_shutdown = shutdown.subscribe();
        {
            let faulted = faulted.clone();
            let on_failure = on_failure.clone();
            tokio::spawn(async move {
                let mut ticker = interval(interval_period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    select! {
                        _ = action_shutdown.recv() => break,
                        _ = ticker.tick() => {}
                    }

                    select! {
                        _ = action_shutdown.recv() => break,
                        res = action() => {
                            match res {
                                Ok(()) => {
                                    trace!(heartbeat = name, "beat");
                                    if faulted.swap(false, Ordering::SeqCst) {
                                        debug!(heartbeat = name, "recovered");
                                        on_failure(None);
                                    }
                                }
                                Err(err) => {
                                    if faulted.swap(true, Ordering::SeqCst) {
                                        debug!(heartbeat = name, "still failing: {err}");
                                    } else {
                                        warn!(heartbeat = name, "failed: {err}");
                                        on_failure(Some(HeartbeatError::Action(err.to_string())));
                                    }
                                }
                            }
                            let _ = beat_tx.send(());
                        }
                    }
                }
                debug!(heartbeat = name, "action loop stopped");
            });
        }

        let mut watchdog_shutdown = shutdown.subscribe();
        {
            let faulted = faulted.clone();
            let on_failure = on_failure.clone();
            let mut beat_rx = beat_rx;
            let window = interval_period * 3 + WATCHDOG_OFFSET;
            tokio::spawn(async move {
                loop {
                    select! {
                        _ = watchdog_shutdown.recv() => break,
                        res = tokio::time::timeout(window, beat_rx.changed()) => match res {
                            // Beat observed in time.
                            Ok(Ok(())) => {}
                            // Action loop gone, nothing left to watch.
                            Ok(Err(_)) => break,
                            Err(_) => {
                                if !faulted.swap(true, Ordering::SeqCst) {
                                    warn!(heartbeat = name, "stalled for {window:?}");
                                    on_failure(Some(HeartbeatError::Timeout(window)));
                                }
                            }
                        }
                    }
                }
                debug!(heartbeat = name, "watchdog stopped");
            });
        }

        Self { shutdown }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tokio::time::sleep;

    type Reports = Arc<Mutex<Vec<Option<HeartbeatError>>>>;

    fn recorder() -> (Reports, impl Fn(Option<HeartbeatError>) + Send + Sync + 'static) {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        (reports, move |err| sink.lock().unwrap().push(err))
    }

    #[tokio::test]
    async fn repeated_failure_is_reported_once() {
        let (reports, on_failure) = recorder();

        let _hb = Heartbeat::spawn(
            "test",
            Duration::from_millis(10),
            || async { Err::<(), _>("boom") },
            on_failure,
        );

        sleep(Duration::from_millis(100)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], Some(HeartbeatError::Action(_))));
    }

    #[tokio::test]
    async fn recovery_reports_none() {
        let (reports, on_failure) = recorder();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let _hb = Heartbeat::spawn(
            "test",
            Duration::from_millis(10),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
            on_failure,
        );

        sleep(Duration::from_millis(100)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0], Some(HeartbeatError::Action(_))));
        assert!(reports[1].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_action_trips_the_watchdog() {
        let (reports, on_failure) = recorder();

        let _hb = Heartbeat::spawn(
            "test",
            Duration::from_secs(5),
            || async {
                futures::future::pending::<()>().await;
                Ok::<(), &str>(())
            },
            on_failure,
        );

        // Three intervals plus the offset, and a little extra.
        sleep(Duration::from_secs(17)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], Some(HeartbeatError::Timeout(_))));
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_loops() {
        let (reports, on_failure) = recorder();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let hb = Heartbeat::spawn(
            "test",
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            },
            on_failure,
        );

        sleep(Duration::from_millis(50)).await;
        drop(hb);
        let runs_at_drop = runs.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;

        // At most one run may have been in flight when the handle dropped.
        assert!(runs.load(Ordering::SeqCst) <= runs_at_drop + 1);
        assert_eq!(reports.lock().unwrap().len(), 1);
    }
}
