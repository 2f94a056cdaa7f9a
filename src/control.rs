//! Command controller.
//!
//! Accepts a desired appliance state, issues the matching cloud command,
//! overlays an optimistic override while the command is in flight and waits
//! for the polled ground state to confirm it. Rapid successive targets
//! coalesce: a newer target aborts the pending one and only the latest is
//! ever converged on.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::status::{DeviceStatus, SimpleActivity};
use crate::sync::{StatusOverride, Synchronizer};

/// Confirmation always gets at least this long, even on fast poll cadences.
const MIN_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A desired appliance state the controller can drive towards.
pub trait Command: Clone + PartialEq + Send + Sync + 'static {
    /// Overlay the expected effect on a status snapshot.
    fn apply(&self, status: &mut DeviceStatus);

    /// Whether the polled state shows the command took effect. `None` means
    /// the state is not known well enough to tell either way.
    fn is_satisfied(&self, status: &DeviceStatus) -> Option<bool>;
}

// Every command doubles as the optimistic override for its own flight.
impl<T: Command> StatusOverride for T {
    fn apply(&self, status: &mut DeviceStatus) {
        Command::apply(self, status);
    }
}

struct Pending<T> {
    target: T,
    abort: Arc<Notify>,
}

pub struct Controller<T: Command> {
    sync: Synchronizer,
    issue: Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>,
    pending: Arc<Mutex<Option<Pending<T>>>>,
    timeout: Duration,
}

impl<T: Command> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            sync: self.sync.clone(),
            issue: self.issue.clone(),
            pending: self.pending.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T: Command> Controller<T> {
    pub fn new<I, F>(sync: Synchronizer, poll_interval: Duration, issue: I) -> Self
    where
        I: Fn(T) -> F + Send + Sync + 'static,
        F: std::future::Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        Self {
            sync,
            issue: Arc::new(move |target| Box::pin(issue(target))),
            pending: Arc::new(Mutex::new(None)),
            timeout: command_timeout(poll_interval),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending<T>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drive the appliance towards `target`.
    ///
    /// Never fails from the caller's point of view; issue errors and
    /// confirmation timeouts surface through the status fault fields and the
    /// log. Setting the already pending target, or a target the ground
    /// state already satisfies, is a no-op. Replacing a pending target swaps
    /// it in place: the running flight re-issues the newest target once its
    /// current request has returned, so command requests never overlap.
    pub fn set(&self, target: T) {
        let mut pending = self.lock();
        match pending.as_mut() {
            // Already driving towards this target.
            Some(p) if p.target == target => {}
            Some(p) => {
                p.target = target.clone();
                self.sync.set_override(Arc::new(target));
                // The permit is stored if the flight is mid-request.
                p.abort.notify_one();
            }
            None => {
                if target.is_satisfied(&self.sync.ground_status()) == Some(true) {
                    return;
                }
                let abort = Arc::new(Notify::new());
                *pending = Some(Pending {
                    target: target.clone(),
                    abort: abort.clone(),
                });
                self.sync.set_override(Arc::new(target));
                tokio::spawn(self.clone().run(abort));
            }
        }
    }

    // The single flight task for this controller. Each outer iteration
    // issues the newest pending target and waits for it to settle; a
    // replacement only takes over after the request in flight has returned.
    async fn run(self, abort: Arc<Notify>) {
        let mut changed = self.sync.subscribe_changed();

        loop {
            let Some(target) = self.lock().as_ref().map(|p| p.target.clone()) else {
                return;
            };

            let deadline = Instant::now() + self.timeout;
            if let Err(err) = (self.issue)(target.clone()).await {
                warn!("command failed: {err}");
                if self.settle(&target) {
                    return;
                }
                continue;
            }

            loop {
                if self.replaced(&target) {
                    break;
                }
                // Confirmation reads the ground snapshot; the override this
                // flight installed cannot satisfy its own target.
                if target.is_satisfied(&self.sync.ground_status()) == Some(true) {
                    debug!("command confirmed");
                    if self.settle(&target) {
                        return;
                    }
                    break;
                }

                select! {
                    // Target swapped; the outer loop re-reads and re-issues.
                    _ = abort.notified() => {}
                    _ = sleep_until(deadline) => {
                        warn!("command not confirmed within {:?}", self.timeout);
                        if self.settle(&target) {
                            return;
                        }
                        break;
                    }
                    res = changed.changed() => {
                        if res.is_err() {
                            let _ = self.settle(&target);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn replaced(&self, issued: &T) -> bool {
        self.lock().as_ref().is_some_and(|p| p.target != *issued)
    }

    // Clear the pending slot and the override unless a newer target arrived
    // in the meantime; returns whether the flight is done.
    fn settle(&self, issued: &T) -> bool {
        let mut pending = self.lock();
        match pending.as_ref() {
            Some(p) if p.target == *issued => {
                *pending = None;
                drop(pending);
                self.sync.clear_override();
                true
            }
            _ => false,
        }
    }
}

fn command_timeout(poll_interval: Duration) -> Duration {
    std::cmp::max(poll_interval * 3, MIN_COMMAND_TIMEOUT)
}

/// The activity targets an appliance accepts over the command endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetActivity {
    Clean,
    SpotClean,
    Pause,
    Resume,
    Dock,
    Stop,
}

impl TargetActivity {
    /// Wire name for the command endpoint.
    pub fn name(&self) -> &'static str {
        match self {
            TargetActivity::Clean => "clean",
            TargetActivity::SpotClean => "spot_clean",
            TargetActivity::Pause => "pause",
            TargetActivity::Resume => "resume",
            TargetActivity::Dock => "dock",
            TargetActivity::Stop => "stop",
        }
    }
}

impl Command for TargetActivity {
    fn apply(&self, status: &mut DeviceStatus) {
        use crate::status::Activity;
        status.activity = Some(match self {
            TargetActivity::Clean | TargetActivity::Resume => Activity::Cleaning,
            TargetActivity::SpotClean => Activity::SpotCleaning,
            TargetActivity::Pause => Activity::Paused,
            TargetActivity::Dock => Activity::Returning,
            TargetActivity::Stop => Activity::Idle,
        });
    }

    fn is_satisfied(&self, status: &DeviceStatus) -> Option<bool> {
        let simple = status.simple_activity?;
        Some(match self {
            // A recharge pitstop still counts as an ongoing clean, and an
            // appliance already back on the dock satisfies a recall.
            TargetActivity::Clean | TargetActivity::SpotClean | TargetActivity::Resume => {
                matches!(simple, SimpleActivity::Cleaning | SimpleActivity::Pitstop)
            }
            TargetActivity::Pause => simple == SimpleActivity::Paused,
            TargetActivity::Dock => {
                matches!(simple, SimpleActivity::Returning | SimpleActivity::Docked)
            }
            TargetActivity::Stop => !matches!(
                simple,
                SimpleActivity::Cleaning | SimpleActivity::Pitstop | SimpleActivity::Returning
            ),
        })
    }
}
