//! Device state synchronizer.
//!
//! The synchronizer owns the canonical status for one appliance. Poll
//! results, error signals and optimistic overrides all funnel through a
//! single locked update step that merges inputs, recomputes derived fields
//! and emits one event per changed field, so subscribers never observe a
//! half-applied update.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::status::{DeviceStatus, RobotState, StatusEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An optimistic adjustment layered on top of polled state.
///
/// Overrides only affect the visible snapshot; the ground snapshot stays
/// override free so a pending command cannot confirm itself.
pub trait StatusOverride: Send + Sync {
    fn apply(&self, status: &mut DeviceStatus);
}

struct Inner {
    /// Raw fields and error flags accumulated across polls.
    status: DeviceStatus,
    /// Last derived snapshot without overrides.
    ground: DeviceStatus,
    /// Last emitted snapshot with the override applied.
    visible: DeviceStatus,
    /// Message ids already announced. Cleared when the appliance reports an
    /// empty list so a recurring message alerts again.
    seen_messages: HashSet<String>,
    active_override: Option<Arc<dyn StatusOverride>>,
}

#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<StatusEvent>,
    changed: Arc<watch::Sender<u64>>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: DeviceStatus::default(),
                ground: DeviceStatus::default(),
                visible: DeviceStatus::default(),
                seen_messages: HashSet::new(),
                active_override: None,
            })),
            events,
            changed: Arc::new(changed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Merge a successful poll result and emit the resulting changes.
    pub fn update_from_poll(&self, raw: RobotState) {
        let mut inner = self.lock();
        inner.status.merge_raw(raw);
        inner.status.poll_error = false;

        let Inner {
            status,
            seen_messages,
            ..
        } = &mut *inner;
        if status.messages.is_empty() {
            seen_messages.clear();
        } else {
            for msg in &status.messages {
                if seen_messages.insert(msg.id.clone()) {
                    debug!(message = %msg.id, "new appliance message");
                    let _ = self.events.send(StatusEvent::NewMessage(msg.clone()));
                }
            }
        }

        self.refresh(&mut inner);
    }

    /// Flag or clear a polling fault for this appliance.
    pub fn set_poll_error(&self, failing: bool) {
        let mut inner = self.lock();
        if inner.status.poll_error != failing {
            inner.status.poll_error = failing;
            self.refresh(&mut inner);
        }
    }

    /// Flag or clear an account wide server fault.
    pub fn set_server_error(&self, failing: bool) {
        let mut inner = self.lock();
        if inner.status.server_error != failing {
            inner.status.server_error = failing;
            self.refresh(&mut inner);
        }
    }

    pub fn set_override(&self, active_override: Arc<dyn StatusOverride>) {
        let mut inner = self.lock();
        inner.active_override = Some(active_override);
        self.refresh(&mut inner);
    }

    pub fn clear_override(&self) {
        let mut inner = self.lock();
        if inner.active_override.take().is_some() {
            self.refresh(&mut inner);
        }
    }

    /// The snapshot consumers see, overrides applied.
    pub fn status(&self) -> DeviceStatus {
        self.lock().visible.clone()
    }

    /// The snapshot as last polled, overrides ignored.
    pub fn ground_status(&self) -> DeviceStatus {
        self.lock().ground.clone()
    }

    /// Per-field change events for the visible snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// A counter bumped whenever the ground snapshot changes. Command
    /// confirmation waits on this instead of the event stream so overrides
    /// cannot mask or fake a confirmation.
    pub fn subscribe_changed(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    // Derive, diff and emit under the caller's lock.
    fn refresh(&self, inner: &mut Inner) {
        let mut ground = inner.status.clone();
        ground.recompute();

        let mut visible = ground.clone();
        if let Some(active_override) = &inner.active_override {
            active_override.apply(&mut visible);
            visible.recompute();
        }

        if ground != inner.ground {
            self.changed.send_modify(|n| *n += 1);
        }

        for event in visible.diff(&inner.visible) {
            let _ = self.events.send(event);
        }

        inner.ground = ground;
        inner.visible = visible;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Activity, BatteryLevel, DustbinState, Message, SimpleActivity};

    fn poll(activity: Activity) -> RobotState {
        RobotState {
            battery: Some(BatteryLevel::High),
            activity: Some(activity),
            dustbin: Some(DustbinState::Empty),
            connected: Some(true),
            enabled: Some(true),
            power_mode: None,
            messages: Vec::new(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn first_poll_emits_events_for_set_fields() {
        let sync = Synchronizer::new();
        let mut rx = sync.subscribe();

        sync.update_from_poll(poll(Activity::Cleaning));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, StatusEvent::Activity { new: Some(Activity::Cleaning), .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StatusEvent::IsActive { new: Some(true), .. })));
        assert_eq!(sync.status().simple_activity, Some(SimpleActivity::Cleaning));
    }

    #[test]
    fn identical_poll_emits_nothing() {
        let sync = Synchronizer::new();
        sync.update_from_poll(poll(Activity::Docked));

        let mut rx = sync.subscribe();
        sync.update_from_poll(poll(Activity::Docked));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn messages_deduplicate_until_list_clears() {
        let sync = Synchronizer::new();
        let mut rx = sync.subscribe();

        let with_message = |id: &str| {
            let mut raw = poll(Activity::Docked);
            raw.messages = vec![Message {
                id: id.to_string(),
                text: Some("stuck on rug".to_string()),
            }];
            raw
        };

        sync.update_from_poll(with_message("m1"));
        sync.update_from_poll(with_message("m1"));
        let announcements = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, StatusEvent::NewMessage(_)))
            .count();
        assert_eq!(announcements, 1);

        // Empty list resets the dedup set; the same id alerts again.
        sync.update_from_poll(poll(Activity::Docked));
        sync.update_from_poll(with_message("m1"));
        let announcements = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, StatusEvent::NewMessage(_)))
            .count();
        assert_eq!(announcements, 1);
    }

    #[test]
    fn override_affects_visible_but_not_ground() {
        struct ForceCleaning;
        impl StatusOverride for ForceCleaning {
            fn apply(&self, status: &mut DeviceStatus) {
                status.activity = Some(Activity::Cleaning);
            }
        }

        let sync = Synchronizer::new();
        sync.update_from_poll(poll(Activity::Docked));

        let mut changed = sync.subscribe_changed();
        changed.mark_unchanged();

        sync.set_override(Arc::new(ForceCleaning));

        assert_eq!(sync.status().activity, Some(Activity::Cleaning));
        assert_eq!(sync.ground_status().activity, Some(Activity::Docked));
        // Overrides never tick the ground change counter.
        assert!(!changed.has_changed().unwrap());

        sync.clear_override();
        assert_eq!(sync.status().activity, Some(Activity::Docked));
    }

    #[test]
    fn ground_change_ticks_the_counter() {
        let sync = Synchronizer::new();
        sync.update_from_poll(poll(Activity::Docked));

        let mut changed = sync.subscribe_changed();
        changed.mark_unchanged();

        sync.update_from_poll(poll(Activity::Docked));
        assert!(!changed.has_changed().unwrap());

        sync.update_from_poll(poll(Activity::Cleaning));
        assert!(changed.has_changed().unwrap());
    }

    #[test]
    fn poll_error_raises_and_clears_fault() {
        let sync = Synchronizer::new();
        sync.update_from_poll(poll(Activity::Docked));
        let mut rx = sync.subscribe();

        sync.set_poll_error(true);
        assert!(sync.status().is_fault);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, StatusEvent::IsFault { new: true, .. })));

        // Setting the same flag again is a no-op.
        sync.set_poll_error(true);
        assert!(drain(&mut rx).is_empty());

        sync.set_poll_error(false);
        assert!(!sync.status().is_fault);
    }

    #[test]
    fn server_error_fault_clears_on_recovery() {
        let sync = Synchronizer::new();
        sync.update_from_poll(poll(Activity::Docked));

        sync.set_server_error(true);
        assert!(sync.status().is_fault);
        assert!(sync.ground_status().is_fault);

        sync.set_server_error(false);
        assert!(!sync.status().is_fault);
    }
}
