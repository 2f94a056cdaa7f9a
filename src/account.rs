//! Account orchestration.
//!
//! An account bundles the authorized session, the appliance roster and the
//! per-appliance machinery: one synchronizer, one controller and one poll
//! heartbeat per robot, plus an account wide health heartbeat that fans a
//! backend outage out to every appliance.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::api::{ApiClient, ApiError, ApiRequest};
use crate::auth::{AuthState, Session};
use crate::config::{AccountConfig, ConfigError};
use crate::control::{Controller, TargetActivity};
use crate::heartbeat::Heartbeat;
use crate::status::{DeviceStatus, RobotState, StatusEvent};
use crate::store::Store;
use crate::sync::Synchronizer;

/// Vendor imposed request budget per account per day. The status poll
/// cadence is stretched so the whole fleet stays under it.
const DAILY_CALL_CEILING: u64 = 5000;

/// How often the appliance roster is re-fetched to detect changes.
const FLEET_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// An appliance as listed by the cloud account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appliance {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub firmware: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApplianceList {
    appliances: Vec<Appliance>,
}

/// An entry from the account activity feed (cleaning runs, errors, firmware
/// notices). Informational only.
#[derive(Debug, Serialize, Deserialize)]
struct FeedItem {
    id: String,
    #[serde(default)]
    appliance_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Feed {
    items: Vec<FeedItem>,
}

/// One managed appliance: its identity plus the machinery keeping its
/// status in sync and driving commands.
pub struct Robot {
    appliance: Appliance,
    sync: Synchronizer,
    controller: Controller<TargetActivity>,
    _poll: Heartbeat,
}

impl Robot {
    fn start(
        appliance: Appliance,
        session: Arc<Session>,
        poll_interval: Duration,
        log_polls: bool,
    ) -> Self {
        let sync = Synchronizer::new();

        let controller = {
            let session = session.clone();
            let path = format!("/appliances/{}/command", appliance.id);
            Controller::new(sync.clone(), poll_interval, move |target: TargetActivity| {
                let session = session.clone();
                let req =
                    ApiRequest::post(path.clone(), json!({ "command": target.name() }))
                        .no_content();
                async move { session.request(&req).await.map(|_| ()) }
            })
        };

        let poll = {
            let session = session.clone();
            let sync = sync.clone();
            let path = format!("/appliances/{}/state", appliance.id);
            let on_failure = {
                let sync = sync.clone();
                move |err: Option<_>| sync.set_poll_error(err.is_some())
            };
            Heartbeat::spawn(
                "poll",
                poll_interval,
                move || {
                    let session = session.clone();
                    let sync = sync.clone();
                    let req = ApiRequest::get(path.clone());
                    async move {
                        let state: RobotState = session.fetch(&req).await?;
                        if log_polls {
                            info!("{} returned {state:?}", req.path);
                        }
                        sync.update_from_poll(state);
                        Ok::<(), ApiError>(())
                    }
                },
                on_failure,
            )
        };

        Self {
            appliance,
            sync,
            controller,
            _poll: poll,
        }
    }

    pub fn id(&self) -> &str {
        &self.appliance.id
    }

    pub fn appliance(&self) -> &Appliance {
        &self.appliance
    }

    /// Current visible status, optimistic overrides applied.
    pub fn status(&self) -> DeviceStatus {
        self.sync.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sync.subscribe()
    }

    /// Drive the appliance towards an activity. Coalesces with any command
    /// already in flight.
    pub fn set_target(&self, target: TargetActivity) {
        self.controller.set(target);
    }
}

pub struct Account {
    session: Arc<Session>,
    robots: Vec<Robot>,
    status_interval: Duration,
    _health: Heartbeat,
    _fleet: Heartbeat,
    _feed: Heartbeat,
}

impl Account {
    /// Authorize the account, discover its appliances and start the sync
    /// machinery for each of them.
    pub async fn start(config: AccountConfig, store: Store) -> Result<Self, AccountError> {
        let config = config.validate()?;
        let api = ApiClient::new(&config)?;
        let session = Arc::new(Session::new(&config, api, store));

        let list: ApplianceList = session.fetch(&ApiRequest::get("/appliances")).await?;

        let mut appliances = Vec::new();
        for appliance in list.appliances {
            if !config.supported_models.is_empty()
                && !config.supported_models.contains(&appliance.model)
            {
                warn!(
                    "skipping {} ({}): model {} is not supported",
                    appliance.name, appliance.id, appliance.model
                );
                continue;
            }
            appliances.push(appliance);
        }
        if appliances.is_empty() {
            warn!("account has no supported appliances");
        }

        let status_interval = effective_status_interval(config.status_interval, appliances.len());
        info!(
            "managing {} appliance(s), polling every {status_interval:?}",
            appliances.len()
        );

        let log_polls = config.debug_enabled("log_polls");
        let robots: Vec<Robot> = appliances
            .into_iter()
            .map(|appliance| Robot::start(appliance, session.clone(), status_interval, log_polls))
            .collect();
        let syncs: Vec<Synchronizer> = robots.iter().map(|r| r.sync.clone()).collect();

        let health = {
            let session = session.clone();
            let syncs = syncs.clone();
            Heartbeat::spawn(
                "health",
                status_interval,
                move || {
                    let session = session.clone();
                    async move {
                        session
                            .request(&ApiRequest::get("/health"))
                            .await
                            .map(|_| ())
                    }
                },
                move |err| {
                    let failing = err.is_some();
                    if let Some(err) = err {
                        warn!("backend health check failed: {err}");
                    }
                    for sync in &syncs {
                        sync.set_server_error(failing);
                    }
                },
            )
        };

        let fleet = {
            let session = session.clone();
            let known: Arc<Mutex<HashSet<String>>> =
                Arc::new(Mutex::new(robots.iter().map(|r| r.id().to_string()).collect()));
            Heartbeat::spawn(
                "fleet",
                FLEET_REFRESH_INTERVAL,
                move || {
                    let session = session.clone();
                    let known = known.clone();
                    async move {
                        let list: ApplianceList =
                            session.fetch(&ApiRequest::get("/appliances")).await?;
                        let current: HashSet<String> =
                            list.appliances.iter().map(|a| a.id.clone()).collect();

                        let mut known = match known.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        for appliance in &list.appliances {
                            if !known.contains(&appliance.id) {
                                info!(
                                    "new appliance {} ({}); restart the account to manage it",
                                    appliance.name, appliance.id
                                );
                            }
                        }
                        for id in known.iter().filter(|id| !current.contains(*id)) {
                            warn!("appliance {id} is no longer listed on the account");
                        }
                        *known = current;
                        Ok::<(), ApiError>(())
                    }
                },
                // Roster refresh failures are not appliance faults; the next
                // cycle tries again.
                |_| {},
            )
        };

        let feed = {
            let session = session.clone();
            let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
            Heartbeat::spawn(
                "feed",
                status_interval,
                move || {
                    let session = session.clone();
                    let seen = seen.clone();
                    async move {
                        let feed: Feed = session
                            .fetch(&ApiRequest::get("/feed").with_query("limit", "20"))
                            .await?;
                        let mut seen = match seen.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        announce_new_feed_items(&mut seen, feed.items);
                        Ok::<(), ApiError>(())
                    }
                },
                // The feed is informational; a failed fetch is not a fault.
                |_| {},
            )
        };

        // A terminal authorization denial faults every appliance; no further
        // polls can succeed without new credentials.
        {
            let mut state = session.state();
            let syncs = syncs.clone();
            tokio::spawn(async move {
                loop {
                    if matches!(&*state.borrow_and_update(), AuthState::Denied(_)) {
                        error!("account authorization denied, flagging all appliances");
                        for sync in &syncs {
                            sync.set_server_error(true);
                        }
                        return;
                    }
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        Ok(Self {
            session,
            robots,
            status_interval,
            _health: health,
            _fleet: fleet,
            _feed: feed,
        })
    }

    pub fn robots(&self) -> &[Robot] {
        &self.robots
    }

    pub fn robot(&self, id: &str) -> Option<&Robot> {
        self.robots.iter().find(|r| r.id() == id)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The poll cadence in effect, after stretching for the call ceiling.
    pub fn status_interval(&self) -> Duration {
        self.status_interval
    }
}

/// Log feed entries that were not present on the previous fetch. The seen
/// set is replaced by the current window each time, so it stays bounded by
/// the fetch limit instead of growing for the process lifetime.
fn announce_new_feed_items(seen: &mut HashSet<String>, items: Vec<FeedItem>) -> usize {
    let mut fresh = HashSet::with_capacity(items.len());
    let mut announced = 0;
    for item in items {
        if !seen.contains(&item.id) {
            info!(
                appliance = item.appliance_id.as_deref().unwrap_or("account"),
                "feed: {}",
                item.text.as_deref().unwrap_or(&item.id)
            );
            announced += 1;
        }
        fresh.insert(item.id);
    }
    *seen = fresh;
    announced
}

/// Stretch the configured poll interval so `appliances` state polls stay
/// under the daily call ceiling.
fn effective_status_interval(configured: Duration, appliances: usize) -> Duration {
    if appliances == 0 {
        return configured;
    }
    let floor_secs = (appliances as u64 * 86_400).div_ceil(DAILY_CALL_CEILING);
    let floor = Duration::from_secs(floor_secs);
    if floor > configured {
        warn!(
            "stretching status interval from {configured:?} to {floor:?} to stay under \
             {DAILY_CALL_CEILING} calls per day"
        );
        floor
    } else {
        configured
    }
}
