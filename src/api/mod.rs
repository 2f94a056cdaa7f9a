//! Resilient HTTP client for the vendor cloud API.
//!
//! Every request goes through one retry loop: recognized API-layer failures
//! (transport, non-2xx, validation) are retried with exponential backoff as
//! long as the request method is idempotent. There is no attempt ceiling;
//! this is a best-effort background sync, not a user-facing request, so the
//! loop only stops on a non-retryable outcome.

mod error;

pub use error::ApiError;

use std::cmp;
use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AccountConfig;

/// API key identifying this client to the vendor backend. Fixed per
/// application, not per account.
const API_KEY: &str = "0a64f7e3cadb27fcf86cc1d4f3bf2cdb92b94bf0f71ee86cb7f5f52c07f9d2a1";
const API_KEY_HEADER: &str = "x-api-key";

const USER_AGENT: &str = concat!("whisk/", env!("CARGO_PKG_VERSION"));

/// Canonical request envelope.
///
/// Carries everything needed to (re)build the HTTP request, plus the
/// idempotency flag the retry policy keys on.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Whether the endpoint declares a response payload. When true, a 204
    /// response is itself an error.
    pub expects_body: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            expects_body: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn no_content(mut self) -> Self {
        self.expects_body = false;
        self
    }

    /// Retry eligibility follows HTTP method semantics: GET, HEAD, PUT,
    /// DELETE, OPTIONS and TRACE are idempotent; POST and PATCH are not.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET
                | Method::HEAD
                | Method::PUT
                | Method::DELETE
                | Method::OPTIONS
                | Method::TRACE
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl ApiClient {
    pub fn new(config: &AccountConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.api_endpoint)
            .map_err(|e| ApiError::Request(format!("invalid API endpoint: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(API_KEY));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            timeout: config.request_timeout,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
        })
    }

    /// Perform the request and return the raw JSON body.
    pub async fn execute(&self, req: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        self.run(req, token, Ok).await
    }

    /// Perform the request and deserialize the body into `T`.
    ///
    /// Missing or mistyped required fields are a validation failure (fatal
    /// for the attempt, retry-eligible); top-level fields `T` does not
    /// consume are logged as a warning and otherwise ignored.
    pub async fn fetch<T>(&self, req: &ApiRequest, token: Option<&str>) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Serialize,
    {
        let path = req.path.clone();
        self.run(req, token, move |value| decode_typed(value, &path))
            .await
    }

    async fn run<T, F>(
        &self,
        req: &ApiRequest,
        token: Option<&str>,
        decode: F,
    ) -> Result<T, ApiError>
    where
        F: Fn(Value) -> Result<T, ApiError>,
    {
        let mut backoff = self.backoff_min;
        loop {
            let result = match self.attempt(req, token).await {
                Ok(value) => decode(value),
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if req.is_idempotent() && e.is_retryable() => {
                    warn!(
                        "request to {} failed: {e} ... will retry in {backoff:#?}",
                        req.path
                    );
                    // Jitter keeps a fleet of agents from retrying in phase.
                    let jitter = Duration::from_millis(rand::random_range(0..250));
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = cmp::min(backoff * 2, self.backoff_max);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, req: &ApiRequest, token: Option<&str>) -> Result<Value, ApiError> {
        let mut url = self
            .base
            .join(&req.path)
            .map_err(|e| ApiError::Request(format!("invalid request path: {e}")))?;
        if !req.query.is_empty() {
            url.query_pairs_mut().extend_pairs(req.query.iter());
        }

        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .timeout(self.timeout);

        for (key, value) in &req.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ApiError::Authorization(message));
            }
            return Err(ApiError::Status { status, message });
        }

        if status == StatusCode::NO_CONTENT {
            if req.expects_body {
                return Err(ApiError::Validation(
                    "endpoint declared a payload but the server returned 204".into(),
                ));
            }
            return Ok(Value::Null);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.bytes().await?;

        if content_type.starts_with("application/json") {
            serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::Validation(format!("invalid JSON body: {e}")))
        } else if content_type.starts_with("application/octet-stream") {
            // The backend occasionally ships gzip-compressed JSON under an
            // octet-stream content type, bypassing Content-Encoding.
            let mut json = String::new();
            GzDecoder::new(bytes.as_ref())
                .read_to_string(&mut json)
                .map_err(|e| ApiError::Validation(format!("failed to inflate body: {e}")))?;
            serde_json::from_str(&json)
                .map_err(|e| ApiError::Validation(format!("invalid JSON in gzip body: {e}")))
        } else {
            Err(ApiError::Validation(format!(
                "unexpected content type: {content_type:?}"
            )))
        }
    }
}

/// Build a human-readable message for a non-2xx response, preferring the
/// documented error envelope (`{"message": ..}` or `{"error": ..}`).
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    status
        .canonical_reason()
        .unwrap_or("unknown error")
        .to_string()
}

fn decode_typed<T>(value: Value, path: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned + Serialize,
{
    let typed: T =
        serde_json::from_value(value.clone()).map_err(|e| ApiError::Validation(e.to_string()))?;

    // Surface fields the model does not know about; the backend adds fields
    // without notice and silence here makes those changes invisible.
    if let (Some(raw), Ok(Value::Object(known))) = (value.as_object(), serde_json::to_value(&typed))
    {
        for key in raw.keys().filter(|k| !known.contains_key(*k)) {
            warn!("unexpected field {key:?} in response from {path}");
        }
    }
    debug!("decoded response from {path}");

    Ok(typed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use mockito::Server;
    use serde::Deserialize;
    use serde_json::json;
    use std::io::Write;

    fn test_client(endpoint: String) -> ApiClient {
        let config = AccountConfig {
            api_endpoint: endpoint,
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
            ..AccountConfig::for_tests()
        };
        ApiClient::new(&config).unwrap()
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Health {
        status: String,
    }

    #[tokio::test]
    async fn sends_api_key_and_user_agent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header(API_KEY_HEADER, API_KEY)
            .match_header("user-agent", USER_AGENT)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let health: Health = client
            .fetch(&ApiRequest::get("/health"), None)
            .await
            .unwrap();

        assert_eq!(health.status, "ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_idempotent_requests_until_success() {
        let mut server = Server::new_async().await;
        let failures = server
            .mock("GET", "/state")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;
        let success = server
            .mock("GET", "/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"recovered"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let health: Health = client
            .fetch(&ApiRequest::get("/state"), None)
            .await
            .unwrap();

        assert_eq!(health.status, "recovered");
        failures.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps_at_the_configured_max() {
        use std::sync::{Arc, Mutex};
        use std::time::Instant;

        let hits: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let mut server = Server::new_async().await;
        let record = hits.clone();
        let failures = server
            .mock("GET", "/state")
            .with_status(500)
            .with_body_from_request(move |_| {
                record.lock().unwrap().push(Instant::now());
                Vec::new()
            })
            .expect(4)
            .create_async()
            .await;
        let record = hits.clone();
        let success = server
            .mock("GET", "/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(move |_| {
                record.lock().unwrap().push(Instant::now());
                br#"{"status":"ok"}"#.to_vec()
            })
            .create_async()
            .await;

        let config = AccountConfig {
            api_endpoint: server.url(),
            backoff_min: Duration::from_millis(250),
            backoff_max: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            ..AccountConfig::for_tests()
        };
        let client = ApiClient::new(&config).unwrap();
        let health: Health = client
            .fetch(&ApiRequest::get("/state"), None)
            .await
            .unwrap();
        assert_eq!(health.status, "ok");

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 5);
        let gaps: Vec<Duration> = hits.windows(2).map(|w| w[1] - w[0]).collect();

        // 250ms, 500ms, then capped at 1s for the remaining delays. Jitter
        // and scheduling only ever lengthen a gap.
        let floors = [250u64, 500, 1000, 1000].map(Duration::from_millis);
        for (gap, floor) in gaps.iter().zip(floors) {
            assert!(*gap >= floor, "gap {gap:?} shorter than {floor:?}");
        }
        // Without the cap the fourth delay would be at least 2s; jitter tops
        // out at 250ms, so anything under 1.75s proves the cap held.
        assert!(
            gaps[3] < Duration::from_millis(1750),
            "cap not applied: {:?}",
            gaps[3]
        );

        failures.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn never_retries_non_idempotent_requests() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/commands")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(server.url());
        let res = client
            .execute(
                &ApiRequest::post("/commands", json!({"command": "start"})),
                None,
            )
            .await;

        assert!(matches!(
            res,
            Err(ApiError::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn never_retries_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(server.url());
        let res = client.execute(&ApiRequest::get("/missing"), None).await;

        assert!(matches!(
            res,
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn classifies_unauthorized_as_authorization_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/state")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"token expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(server.url());
        let res = client.execute(&ApiRequest::get("/state"), None).await;

        match res {
            Err(ApiError::Authorization(message)) => assert_eq!(message, "token expired"),
            other => panic!("expected authorization error, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn extracts_message_from_error_envelope() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/commands")
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"robot is busy"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let res = client
            .execute(&ApiRequest::post("/commands", json!({})), None)
            .await;

        match res {
            Err(ApiError::Status { message, .. }) => assert_eq!(message, "robot is busy"),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inflates_gzip_under_octet_stream() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"status":"compressed"}"#).unwrap();
        let body = encoder.finish().unwrap();

        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/state")
            .with_status(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(body)
            .create_async()
            .await;

        let client = test_client(server.url());
        let health: Health = client
            .fetch(&ApiRequest::get("/state"), None)
            .await
            .unwrap();

        assert_eq!(health.status, "compressed");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejects_unexpected_content_types() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/commands")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;

        let client = test_client(server.url());
        let res = client
            .execute(&ApiRequest::post("/commands", json!({})), None)
            .await;

        assert!(matches!(res, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_response_is_an_error_when_payload_expected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/commands")
            .with_status(204)
            .expect(2)
            .create_async()
            .await;

        let client = test_client(server.url());

        let res = client
            .execute(&ApiRequest::post("/commands", json!({})), None)
            .await;
        assert!(matches!(res, Err(ApiError::Validation(_))));

        let res = client
            .execute(&ApiRequest::post("/commands", json!({})).no_content(), None)
            .await;
        assert!(matches!(res, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn retries_schema_validation_failures() {
        let mut server = Server::new_async().await;
        let bad = server
            .mock("GET", "/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": 42}"#)
            .expect(1)
            .create_async()
            .await;
        let good = server
            .mock("GET", "/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let health: Health = client
            .fetch(&ApiRequest::get("/state"), None)
            .await
            .unwrap();

        assert_eq!(health.status, "ok");
        bad.assert_async().await;
        good.assert_async().await;
    }

    #[test]
    fn idempotency_follows_method_semantics() {
        assert!(ApiRequest::get("/x").is_idempotent());
        assert!(ApiRequest::new(Method::PUT, "/x").is_idempotent());
        assert!(ApiRequest::new(Method::DELETE, "/x").is_idempotent());
        assert!(!ApiRequest::post("/x", json!({})).is_idempotent());
        assert!(!ApiRequest::new(Method::PATCH, "/x").is_idempotent());
    }
}
