//! HTTP client for the registration/login collaborator.
//!
//! The auth service is a small JSON-over-HTTP API: request a verification
//! code, redeem it for login credentials, exchange credentials for a
//! short-lived session, and invalidate a session. All endpoints live under
//! `https://{server}/v1/`.
//!
//! Session logic talks to this through the [`AuthBackend`] trait so it can be
//! exercised in tests without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use wl_core::constants;
use wl_core::error::{WlError, WlResult};

/// Request body for `POST /v1/code`.
#[derive(Debug, Clone, Serialize)]
pub struct CodeRequest {
    /// Country code.
    pub cc: String,
    /// Local number without country code.
    #[serde(rename = "in")]
    pub number: String,
    /// Delivery method: "sms" or "voice".
    pub method: String,
    /// Registration token.
    pub token: String,
    /// Client identifier.
    pub client: String,
}

/// Response body for `POST /v1/code`.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeResponse {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `POST /v1/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub cc: String,
    #[serde(rename = "in")]
    pub number: String,
    /// Verification code received out of band.
    pub code: String,
    pub client: String,
}

/// Response body for `POST /v1/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Long-lived login token.
    #[serde(default)]
    pub login: Option<String>,
    /// Credential lifetime in seconds.
    #[serde(default)]
    pub ttl: Option<i64>,
    /// Chat server domain to connect to.
    #[serde(default)]
    pub chat_dns_domain: Option<String>,
    #[serde(default)]
    pub edge_routing_info: Option<String>,
}

/// Request body for `POST /v1/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    /// The stored login token.
    pub credentials: String,
    pub device_id: String,
    pub protocol_version: String,
}

/// Response body for `POST /v1/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Offending parameter when `reason` is "bad_param".
    #[serde(default)]
    pub param_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    /// Session lifetime in seconds.
    #[serde(default)]
    pub ttl: Option<i64>,
    /// Rotated login token, when the server chooses to rotate.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the rotated token in seconds.
    #[serde(default)]
    pub refresh_ttl: Option<i64>,
}

/// Request body for `POST /v1/logout`.
#[derive(Debug, Clone, Serialize)]
pub struct LogoutRequest {
    pub session_id: String,
}

/// The auth collaborator as seen by the session manager.
///
/// `server` selects the host for endpoints that may move with the account's
/// issued chat domain (login/logout); code/register always target the
/// registration server the backend was built with.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn request_code(&self, req: &CodeRequest) -> WlResult<CodeResponse>;
    async fn register(&self, req: &RegisterRequest) -> WlResult<RegisterResponse>;
    async fn login(&self, server: &str, req: &LoginRequest) -> WlResult<LoginResponse>;
    async fn logout(&self, server: &str, req: &LogoutRequest) -> WlResult<()>;
}

/// Production [`AuthBackend`] over reqwest.
pub struct HttpAuthApi {
    inner: Client,
    /// Registration server domain.
    server: String,
    /// Default request timeout.
    timeout: Duration,
    /// Extended timeout for login.
    login_timeout: Duration,
}

impl HttpAuthApi {
    /// Create a new auth API client.
    pub fn new(server: &str, user_agent: &str, request_timeout: Duration) -> WlResult<Self> {
        let inner = Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WlError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            server: server.to_string(),
            timeout: request_timeout,
            login_timeout: Duration::from_secs(constants::LOGIN_TIMEOUT_SECS),
        })
    }

    fn url(server: &str, endpoint: &str) -> String {
        format!("https://{server}/{}/{endpoint}", constants::API_VERSION)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> WlResult<T> {
        debug!("POST {url}");
        let response = self
            .inner
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_error)?;

        let response = check_status(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| WlError::Serialization(format!("failed to parse response: {e}")))
    }
}

#[async_trait]
impl AuthBackend for HttpAuthApi {
    async fn request_code(&self, req: &CodeRequest) -> WlResult<CodeResponse> {
        self.post_json(&Self::url(&self.server, "code"), req, self.timeout)
            .await
    }

    async fn register(&self, req: &RegisterRequest) -> WlResult<RegisterResponse> {
        self.post_json(&Self::url(&self.server, "register"), req, self.timeout)
            .await
    }

    async fn login(&self, server: &str, req: &LoginRequest) -> WlResult<LoginResponse> {
        self.post_json(&Self::url(server, "login"), req, self.login_timeout)
            .await
    }

    async fn logout(&self, server: &str, req: &LogoutRequest) -> WlResult<()> {
        debug!("POST logout to {server}");
        let response = self
            .inner
            .post(Self::url(server, "logout"))
            .timeout(self.timeout)
            .json(req)
            .send()
            .await
            .map_err(classify_error)?;
        check_status(response).map(|_| ())
    }
}

/// Map an HTTP status to the error taxonomy, passing 2xx through.
fn check_status(response: reqwest::Response) -> WlResult<reqwest::Response> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(WlError::Authentication(format!("server returned {status}")));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(WlError::RateLimit(format!("server returned {status}")));
    }

    if status.is_server_error() || status.is_client_error() {
        return Err(WlError::Server {
            status: status.as_u16(),
            message: format!("unexpected status {status}"),
        });
    }

    Ok(response)
}

/// Classify a reqwest error into the taxonomy.
fn classify_error(e: reqwest::Error) -> WlError {
    if e.is_timeout() {
        WlError::Timeout(e.to_string())
    } else {
        WlError::Connection(e.to_string())
    }
}

/// Generate a fresh client/device identifier.
pub fn generate_client_id() -> String {
    format!("WavelineClient-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Generate an opaque registration token.
pub fn generate_registration_token() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
