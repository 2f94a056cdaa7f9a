//! Cloud account agent for a fleet of robot vacuums.
//!
//! The crate connects to the vendor cloud, keeps one reconciled status per
//! appliance and drives appliances towards requested activities. The moving
//! parts, bottom up:
//!
//! - [`api`]: HTTP client with an idempotency aware retry policy.
//! - [`auth`]: credential cache and background token refresh.
//! - [`heartbeat`]: periodic actions with a stall watchdog.
//! - [`status`]: the status model and its derived fields.
//! - [`sync`]: per appliance merge, derive and diff pipeline.
//! - [`control`]: command issue with optimistic overrides and ground state
//!   confirmation.
//! - [`account`]: discovery and wiring of all of the above.
//!
//! The usual entry point is [`Account::start`], which authorizes the
//! account, lists its appliances and returns a handle per robot.

pub mod account;
pub mod api;
pub mod auth;
pub mod config;
pub mod control;
pub mod heartbeat;
pub mod status;
pub mod store;
pub mod sync;

mod json;

pub use account::{Account, AccountError, Appliance, Robot};
pub use api::{ApiClient, ApiError, ApiRequest};
pub use auth::{AuthState, Credential, Session};
pub use config::{AccountConfig, ConfigError};
pub use control::{Command, Controller, TargetActivity};
pub use heartbeat::{Heartbeat, HeartbeatError};
pub use status::{
    Activity, BatteryLevel, DeviceStatus, DustbinState, Message, PowerMode, RobotState,
    SimpleActivity, StatusEvent,
};
pub use store::{Store, StoreError};
pub use sync::{StatusOverride, Synchronizer};
