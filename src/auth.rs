//! Account authorization.
//!
//! A session owns the OAuth credential for one account and refreshes it
//! ahead of expiry in a background task. Requests go through the session so
//! they always carry the current access token; a rejected refresh puts the
//! session in a terminal denied state instead of hammering the backend.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::select;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError, ApiRequest};
use crate::config::AccountConfig;
use crate::store::Store;

/// How long after startup the first refresh of an unproven seed credential
/// runs. The seed tokens come from the vendor app pairing flow and their
/// real expiry is unknown.
const SEED_REFRESH_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry so the value survives restarts.
    #[serde(with = "crate::json::unix_ms")]
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Unauthorized,
    /// A refresh is in flight and the previous token is already expired, so
    /// requests hold off until it settles.
    Authorizing,
    Authorized(Credential),
    /// The backend rejected the refresh credentials. Terminal until the
    /// account is reconfigured.
    Denied(String),
}

/// Blob store key for the cached credential, derived from the client
/// identity so changing `client_id` or `client_secret` discards the cache.
fn credential_key(client_id: &str, client_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(client_secret.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("credential-{}", &digest[..16])
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Some backends rotate the refresh token, some echo it, some omit it.
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

pub struct Session {
    api: ApiClient,
    state: watch::Receiver<AuthState>,
    refresh_now: Arc<Notify>,
    shutdown: broadcast::Sender<()>,
}

impl Session {
    /// Build a session and start its refresh task.
    pub fn new(config: &AccountConfig, api: ApiClient, store: Store) -> Self {
        let (state_tx, state_rx) = watch::channel(AuthState::Unauthorized);
        let (shutdown, shutdown_rx) = broadcast::channel::<()>(1);
        let refresh_now = Arc::new(Notify::new());

        tokio::spawn(refresh_loop(
            config.clone(),
            api.clone(),
            store,
            state_tx,
            refresh_now.clone(),
            shutdown_rx,
        ));

        Self {
            api,
            state: state_rx,
            refresh_now,
            shutdown,
        }
    }

    pub fn state(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }

    /// The current access token, waiting for authorization to settle first.
    pub async fn token(&self) -> Result<String, ApiError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| matches!(s, AuthState::Authorized(_) | AuthState::Denied(_)))
            .await
            .map_err(|_| ApiError::Authorization("authorization task stopped".into()))?;

        match &*settled {
            AuthState::Authorized(cred) => Ok(cred.access_token.clone()),
            AuthState::Denied(reason) => Err(ApiError::Authorization(reason.clone())),
            AuthState::Unauthorized | AuthState::Authorizing => {
                Err(ApiError::Authorization("not authorized".into()))
            }
        }
    }

    /// Perform an authorized request, returning the raw JSON body.
    pub async fn request(&self, req: &ApiRequest) -> Result<Value, ApiError> {
        let token = self.token().await?;
        let result = self.api.execute(req, Some(&token)).await;
        self.nudge_on_rejection(&result);
        result
    }

    /// Perform an authorized request and deserialize the body into `T`.
    pub async fn fetch<T>(&self, req: &ApiRequest) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Serialize,
    {
        let token = self.token().await?;
        let result = self.api.fetch(req, Some(&token)).await;
        self.nudge_on_rejection(&result);
        result
    }

    // A 401 on a live request means the token died early; wake the refresh
    // task rather than waiting out the scheduled window.
    fn nudge_on_rejection<T>(&self, result: &Result<T, ApiError>) {
        if matches!(result, Err(e) if e.is_authorization()) {
            self.refresh_now.notify_one();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn refresh_loop(
    config: AccountConfig,
    api: ApiClient,
    store: Store,
    state: watch::Sender<AuthState>,
    refresh_now: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let key = credential_key(&config.client_id, &config.client_secret);

    let cached: Option<Credential> = match store.read(&key).await {
        Ok(cred) => cred,
        Err(err) => {
            warn!("failed to read cached credential: {err}");
            None
        }
    };

    let mut cred = match cached {
        Some(cred) => {
            debug!("using cached credential");
            cred
        }
        None => {
            info!("no cached credential, seeding from configured tokens");
            Credential {
                access_token: config.token.clone(),
                refresh_token: config.refresh_token.clone(),
                expires_at: SystemTime::now() + config.refresh_window + SEED_REFRESH_DELAY,
            }
        }
    };
    let _ = state.send(AuthState::Authorized(cred.clone()));

    loop {
        // Refresh ahead of expiry by the configured window; a credential
        // already inside the window refreshes immediately.
        let refresh_in = cred
            .expires_at
            .checked_sub(config.refresh_window)
            .and_then(|at| at.duration_since(SystemTime::now()).ok())
            .unwrap_or(Duration::ZERO);

        select! {
            _ = shutdown.recv() => {
                debug!("authorization task stopped");
                return;
            }
            _ = tokio::time::sleep(refresh_in) => {}
            _ = refresh_now.notified() => {
                debug!("early refresh requested");
            }
        }

        // A still-valid token keeps serving requests during a proactive
        // refresh; only an already expired one gates them.
        if cred.expires_at <= SystemTime::now() {
            let _ = state.send(AuthState::Authorizing);
        }

        match refresh(&api, &config, &cred).await {
            Ok(renewed) => {
                info!("credential renewed");
                if let Err(err) = store.write(&key, &renewed).await {
                    warn!("failed to persist credential: {err}");
                }
                let _ = state.send(AuthState::Authorized(renewed.clone()));
                cred = renewed;
            }
            Err(err) if err.is_authorization() => {
                error!("credential refresh rejected: {err}");
                if let Err(err) = store.delete(&key).await {
                    warn!("failed to discard rejected credential: {err}");
                }
                let _ = state.send(AuthState::Denied(err.to_string()));
                return;
            }
            Err(err) => {
                warn!(
                    "credential refresh failed: {err} ... will retry in {:#?}",
                    config.backoff_max
                );
                select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(config.backoff_max) => {}
                }
            }
        }
    }
}

async fn refresh(
    api: &ApiClient,
    config: &AccountConfig,
    cred: &Credential,
) -> Result<Credential, ApiError> {
    let req = ApiRequest::post(
        "/oauth/token",
        json!({
            "grant_type": "refresh_token",
            "refresh_token": cred.refresh_token,
            "client_id": config.client_id,
            "client_secret": config.client_secret,
        }),
    );
    let response: TokenResponse = api.fetch(&req, None).await?;

    Ok(Credential {
        access_token: response.access_token,
        refresh_token: response
            .refresh_token
            .unwrap_or_else(|| cred.refresh_token.clone()),
        expires_at: SystemTime::now() + Duration::from_secs(response.expires_in),
    })
}
