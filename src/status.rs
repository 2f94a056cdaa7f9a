//! Appliance status model.
//!
//! Raw fields arrive verbatim from the cloud API; derived fields are
//! recomputed deterministically from the raw fields plus out-of-band error
//! signals. Consumers never see a derived value computed from a stale raw
//! value because merge, recompute and diff happen as one step inside the
//! synchronizer's update cycle.

use serde::{Deserialize, Serialize};

/// Battery charge bucket, ordered from empty to full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryLevel {
    Dead,
    CriticallyLow,
    Low,
    Medium,
    High,
    Full,
}

/// Raw activity reported by the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Charging,
    Docked,
    Idle,
    Paused,
    Cleaning,
    SpotCleaning,
    Returning,
    Recharging,
    Sleeping,
    Error,
    FirmwareUpgrade,
}

/// Simplified activity exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleActivity {
    Docked,
    Idle,
    Paused,
    Cleaning,
    /// Recharging mid-clean; the run resumes when charged.
    Pitstop,
    Returning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DustbinState {
    Missing,
    Empty,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Eco,
    Standard,
    Turbo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Appliance state as polled from the cloud API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotState {
    #[serde(default)]
    pub battery: Option<BatteryLevel>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub dustbin: Option<DustbinState>,
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub power_mode: Option<PowerMode>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One row of the activity lookup table.
///
/// `docked: None` means the raw activity does not tell whether the appliance
/// sits on the dock; the recompute step then falls back to the battery-full
/// heuristic. That fallback is deliberate, not a missing case.
struct ActivityTraits {
    simple: SimpleActivity,
    docked: Option<bool>,
    charging: bool,
    active: bool,
}

fn activity_traits(activity: Activity) -> ActivityTraits {
    use Activity::*;
    use SimpleActivity as S;

    let row = |simple, docked, charging, active| ActivityTraits {
        simple,
        docked,
        charging,
        active,
    };

    match activity {
        Charging => row(S::Docked, Some(true), true, false),
        Docked => row(S::Docked, Some(true), false, false),
        Idle => row(S::Idle, Some(false), false, false),
        Paused => row(S::Paused, Some(false), false, false),
        Cleaning => row(S::Cleaning, Some(false), false, true),
        SpotCleaning => row(S::Cleaning, Some(false), false, true),
        Returning => row(S::Returning, Some(false), false, true),
        Recharging => row(S::Pitstop, Some(true), true, true),
        Sleeping => row(S::Idle, None, false, false),
        Error => row(S::Idle, None, false, false),
        FirmwareUpgrade => row(S::Idle, None, false, false),
    }
}

/// The reconciled view of one appliance.
///
/// Raw fields are `None` until the first successful poll. Derived fields
/// are only ever written by [`DeviceStatus::recompute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatus {
    // Raw fields, verbatim from the API.
    pub battery: Option<BatteryLevel>,
    pub activity: Option<Activity>,
    pub dustbin: Option<DustbinState>,
    pub connected: Option<bool>,
    pub enabled: Option<bool>,
    pub power_mode: Option<PowerMode>,
    pub messages: Vec<Message>,

    // Out-of-band error signals.
    pub poll_error: bool,
    pub server_error: bool,

    // Derived fields.
    pub simple_activity: Option<SimpleActivity>,
    pub is_docked: Option<bool>,
    pub is_charging: Option<bool>,
    pub is_active: Option<bool>,
    pub is_battery_low: Option<bool>,
    pub is_dustbin_empty: Option<bool>,
    pub is_busy: Option<bool>,
    pub is_fault: bool,
}

impl DeviceStatus {
    /// Merge freshly polled raw fields. `Some` values replace, `None`
    /// leaves the previous observation in place; the message list always
    /// reflects the latest poll.
    pub fn merge_raw(&mut self, raw: RobotState) {
        if raw.battery.is_some() {
            self.battery = raw.battery;
        }
        if raw.activity.is_some() {
            self.activity = raw.activity;
        }
        if raw.dustbin.is_some() {
            self.dustbin = raw.dustbin;
        }
        if raw.connected.is_some() {
            self.connected = raw.connected;
        }
        if raw.enabled.is_some() {
            self.enabled = raw.enabled;
        }
        if raw.power_mode.is_some() {
            self.power_mode = raw.power_mode;
        }
        self.messages = raw.messages;
    }

    /// Recompute every derived field from the raw fields and the
    /// out-of-band error signals.
    pub fn recompute(&mut self) {
        self.is_battery_low = self.battery.map(|b| b <= BatteryLevel::Low);
        self.is_dustbin_empty = self
            .dustbin
            .map(|d| !matches!(d, DustbinState::Missing | DustbinState::Full));

        self.is_fault = self.poll_error
            || self.server_error
            || self.enabled == Some(false)
            || self.connected == Some(false)
            || self.activity == Some(Activity::Error)
            || self.battery == Some(BatteryLevel::Dead)
            || self.is_dustbin_empty == Some(false);

        match self.activity {
            Some(activity) => {
                let traits = activity_traits(activity);
                self.simple_activity = Some(traits.simple);
                self.is_charging = Some(traits.charging);
                // Ambiguous rows fall back to the battery-full heuristic.
                self.is_docked = traits
                    .docked
                    .or_else(|| self.battery.map(|b| b == BatteryLevel::Full));
                self.is_busy = Some(matches!(
                    traits.simple,
                    SimpleActivity::Cleaning | SimpleActivity::Pitstop
                ));
                self.is_active = Some(traits.active && !self.is_fault);
            }
            None => {
                self.simple_activity = None;
                self.is_charging = None;
                self.is_docked = None;
                self.is_busy = None;
                self.is_active = None;
            }
        }
    }

    /// Compare against the previously emitted snapshot and produce one
    /// typed event per changed field.
    pub fn diff(&self, old: &DeviceStatus) -> Vec<StatusEvent> {
        let mut events = Vec::new();

        macro_rules! field {
            ($variant:ident, $field:ident) => {
                if self.$field != old.$field {
                    events.push(StatusEvent::$variant {
                        new: self.$field,
                        old: old.$field,
                    });
                }
            };
        }

        field!(Battery, battery);
        field!(Activity, activity);
        field!(Dustbin, dustbin);
        field!(Connected, connected);
        field!(Enabled, enabled);
        field!(PowerMode, power_mode);
        if !messages_equal(&self.messages, &old.messages) {
            events.push(StatusEvent::Messages {
                new: self.messages.clone(),
                old: old.messages.clone(),
            });
        }
        field!(SimpleActivity, simple_activity);
        field!(IsDocked, is_docked);
        field!(IsCharging, is_charging);
        field!(IsActive, is_active);
        field!(IsBatteryLow, is_battery_low);
        field!(IsDustbinEmpty, is_dustbin_empty);
        field!(IsBusy, is_busy);
        if self.is_fault != old.is_fault {
            events.push(StatusEvent::IsFault {
                new: self.is_fault,
                old: old.is_fault,
            });
        }

        events
    }
}

// Array fields compare by length plus elementwise identity.
fn messages_equal(a: &[Message], b: &[Message]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id == y.id)
}

/// A typed status change notification.
///
/// One variant per status field, each statically bound to its payload type;
/// there are no stringly-typed event names anywhere in the fan-out path.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Battery {
        new: Option<BatteryLevel>,
        old: Option<BatteryLevel>,
    },
    Activity {
        new: Option<Activity>,
        old: Option<Activity>,
    },
    Dustbin {
        new: Option<DustbinState>,
        old: Option<DustbinState>,
    },
    Connected {
        new: Option<bool>,
        old: Option<bool>,
    },
    Enabled {
        new: Option<bool>,
        old: Option<bool>,
    },
    PowerMode {
        new: Option<PowerMode>,
        old: Option<PowerMode>,
    },
    Messages {
        new: Vec<Message>,
        old: Vec<Message>,
    },
    SimpleActivity {
        new: Option<SimpleActivity>,
        old: Option<SimpleActivity>,
    },
    IsDocked {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsCharging {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsActive {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsBatteryLow {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsDustbinEmpty {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsBusy {
        new: Option<bool>,
        old: Option<bool>,
    },
    IsFault {
        new: bool,
        old: bool,
    },
    /// A message id seen for the first time since the list was last
    /// observed empty.
    NewMessage(Message),
}
