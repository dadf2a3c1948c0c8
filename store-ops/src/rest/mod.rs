//! An HTTP client for a hosted Postgres backend: its REST gateway, its auth
//! service and its object storage.
//!
//! A single [`RestClient`] implements [`TableStore`](crate::TableStore),
//! [`SessionSource`](crate::SessionSource) and
//! [`ProofStorage`](crate::tasks::ProofStorage). Table requests are made on
//! behalf of the signed-in identity when there is one, and with the anonymous
//! key otherwise.

use std::{
    env,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::session::{Session, SessionChange};

mod auth;
mod storage;
mod tables;

/// Bucket proof photos are uploaded to unless configured otherwise.
pub const DEFAULT_PROOF_BUCKET: &str = "task_proofs";

const URL_VAR: &str = "STORE_OPS_URL";
const ANON_KEY_VAR: &str = "STORE_OPS_ANON_KEY";
const PROOF_BUCKET_VAR: &str = "STORE_OPS_PROOF_BUCKET";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 16;

/// An error reading [`RestConfig`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("environment variable `{0}` is not set")]
    Missing(&'static str),
}

/// Where the backend lives and how to identify to it.
#[derive(Clone, Debug)]
pub struct RestConfig {
    base_url: String,
    anon_key: SecretString,
    proof_bucket: String,
}

impl RestConfig {
    /// Creates a configuration for the project at `base_url`.
    ///
    /// ```rust
    /// use secrecy::SecretString;
    /// use store_ops::rest::RestConfig;
    ///
    /// let config = RestConfig::new("https://example.test/", SecretString::new("anon".into()))
    ///     .with_proof_bucket("proofs");
    ///
    /// assert_eq!(config.base_url(), "https://example.test");
    /// assert_eq!(config.proof_bucket(), "proofs");
    /// ```
    pub fn new(base_url: &str, anon_key: SecretString) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            anon_key,
            proof_bucket: DEFAULT_PROOF_BUCKET.to_string(),
        }
    }

    /// Reads `STORE_OPS_URL`, `STORE_OPS_ANON_KEY` and, optionally,
    /// `STORE_OPS_PROOF_BUCKET`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &'static str| {
            env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let base_url = var(URL_VAR).ok_or(ConfigError::Missing(URL_VAR))?;
        let anon_key = var(ANON_KEY_VAR).ok_or(ConfigError::Missing(ANON_KEY_VAR))?;

        let mut config = Self::new(&base_url, SecretString::new(anon_key));
        if let Some(bucket) = var(PROOF_BUCKET_VAR) {
            config = config.with_proof_bucket(&bucket);
        }

        Ok(config)
    }

    /// Sets the bucket proof photos are uploaded to.
    pub fn with_proof_bucket(mut self, bucket: &str) -> Self {
        self.proof_bucket = bucket.to_string();
        self
    }

    /// Project URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bucket proof photos are uploaded to.
    pub fn proof_bucket(&self) -> &str {
        &self.proof_bucket
    }
}

#[derive(Debug)]
struct Inner {
    config: RestConfig,
    http: Client,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<SessionChange>,
}

/// A client for the backend's REST, auth and storage endpoints.
///
/// Clones share the same session and session-change feed.
#[derive(Clone, Debug)]
pub struct RestClient {
    inner: Arc<Inner>,
}

impl RestClient {
    /// Creates a client with no session.
    pub fn new(config: RestConfig) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                http,
                session: RwLock::new(None),
                events,
            }),
        }
    }

    /// The client's configuration.
    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    fn session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session_mut(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: SessionChange) {
        // No receivers is not a failure.
        let _ = self.inner.events.send(change);
    }

    /// Starts a request to `path` with the project key and the bearer token of
    /// the current session, or the project key as bearer without one.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let anon_key = self.inner.config.anon_key.expose_secret();
        let bearer = self
            .session()
            .as_ref()
            .map(|session| session.access_token.expose_secret().clone())
            .unwrap_or_else(|| anon_key.clone());

        self.inner
            .http
            .request(method, format!("{}{path}", self.inner.config.base_url))
            .header("apikey", anon_key.as_str())
            .bearer_auth(bearer)
    }
}

/// A response read to completion.
struct Reply {
    status: StatusCode,
    body: String,
}

async fn execute(request: RequestBuilder) -> Result<Reply, reqwest::Error> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok(Reply { status, body })
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    details: Option<String>,
    error: Option<String>,
    code: Option<Value>,
    hint: Option<String>,
}

impl ErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }

    fn code(&self) -> Option<String> {
        match self.code.as_ref()? {
            Value::String(code) => Some(code.clone()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        }
    }

    fn message(&self) -> Option<&str> {
        [
            &self.message,
            &self.msg,
            &self.error_description,
            &self.details,
            &self.error,
        ]
        .into_iter()
        .find_map(|field| field.as_deref().filter(|text| !text.trim().is_empty()))
    }
}

/// A readable explanation of a refused request: the backend's message with its
/// error code and hint, else the raw body, else the status text.
fn error_message(status: StatusCode, body: &str) -> String {
    let error = ErrorBody::parse(body);

    let mut message = error.message().unwrap_or_default().to_string();
    if let Some(code) = error.code() {
        message.push_str(&format!(" (code: {code})"));
    }
    if let Some(hint) = error.hint.as_deref().filter(|hint| !hint.is_empty()) {
        message.push_str(&format!("\nHint: {hint}"));
    }

    let message = message.trim();
    if !message.is_empty() {
        message.to_string()
    } else if !body.trim().is_empty() {
        body.trim().to_string()
    } else {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_backend_message() {
        let body = r#"{"message":"permission denied for table stores","code":"42501","hint":"Check policies"}"#;
        assert_eq!(
            error_message(StatusCode::FORBIDDEN, body),
            "permission denied for table stores (code: 42501)\nHint: Check policies"
        );

        let body = r#"{"code":400,"msg":"Invalid login credentials"}"#;
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, body),
            "Invalid login credentials (code: 400)"
        );

        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, body),
            "Invalid login credentials"
        );
    }

    #[test]
    fn error_message_falls_back() {
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "upstream timed out"),
            "upstream timed out"
        );
        assert_eq!(error_message(StatusCode::NOT_FOUND, ""), "Not Found");
    }

    #[test]
    fn config_trims_base_url() {
        let config = RestConfig::new(" https://example.test// ", SecretString::new("k".into()));
        assert_eq!(config.base_url(), "https://example.test");
        assert_eq!(config.proof_bucket(), DEFAULT_PROOF_BUCKET);
    }
}
