//! Session lifecycle: login, refresh, logout, validity tracking.
//!
//! The session manager owns the short-lived server-issued session and the
//! credential store backing it. Expiry is always decided locally from the
//! stored expiration timestamps; no method performs a network round-trip just
//! to answer a validity question.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wl_core::constants;
use wl_core::error::{WlError, WlResult};
use wl_core::jid::{normalize_phone_number, validate_phone_number};

use crate::api::{
    generate_client_id, generate_registration_token, AuthBackend, CodeRequest, LoginRequest,
    LogoutRequest, RegisterRequest,
};
use crate::credentials::{unix_now, CredentialStore, Credentials};

/// A short-lived server-issued session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub session_key: String,
    pub server_id: String,
    /// Absolute expiration, unix seconds.
    pub expiration: i64,
}

impl Session {
    /// Whether the session is valid as of `now` (unix seconds).
    pub fn is_valid(&self, now: i64) -> bool {
        self.expiration > now
    }

    /// Seconds of validity remaining; negative once expired.
    pub fn remaining(&self, now: i64) -> i64 {
        self.expiration - now
    }
}

/// Retry tuning for transient login failures.
#[derive(Debug, Clone)]
pub struct LoginRetryConfig {
    /// Maximum retry attempts after the first try.
    pub max_retries: u32,
    /// Base delay, doubled on each attempt.
    pub base_delay: Duration,
}

impl Default for LoginRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Owns login/refresh/logout against the auth collaborator and tracks the
/// current session's validity.
pub struct SessionManager {
    backend: Arc<dyn AuthBackend>,
    store: Mutex<CredentialStore>,
    session: Mutex<Option<Session>>,
    client_id: String,
    protocol_version: String,
    registration_server: String,
    retry: LoginRetryConfig,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        store: CredentialStore,
        registration_server: &str,
        protocol_version: &str,
    ) -> Self {
        Self {
            backend,
            store: Mutex::new(store),
            session: Mutex::new(None),
            client_id: generate_client_id(),
            protocol_version: protocol_version.to_string(),
            registration_server: registration_server.to_string(),
            retry: LoginRetryConfig::default(),
        }
    }

    /// Set custom retry tuning.
    pub fn with_retry_config(mut self, retry: LoginRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The client/device identifier presented to the server.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The current session, if one exists (valid or not).
    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    /// The chat server to connect to: the session's issued server when
    /// present, else the credential's chat domain, else the default.
    pub async fn chat_server(&self) -> String {
        if let Some(session) = self.session.lock().await.as_ref() {
            if !session.server_id.is_empty() {
                return session.server_id.clone();
            }
        }
        let store = self.store.lock().await;
        store
            .get()
            .filter(|c| !c.chat_domain.is_empty())
            .map(|c| c.chat_domain.clone())
            .unwrap_or_else(|| constants::DEFAULT_SERVER.to_string())
    }

    /// Request a verification code for `phone` via `method` ("sms" or "voice").
    pub async fn register(&self, phone: &str, method: &str) -> WlResult<()> {
        if method != "sms" && method != "voice" {
            return Err(WlError::BadParam(
                "registration method must be 'sms' or 'voice'".into(),
            ));
        }
        if !validate_phone_number(phone) {
            return Err(WlError::BadParam(format!("invalid phone number: {phone}")));
        }

        let (cc, number) = split_phone(phone);
        let req = CodeRequest {
            cc,
            number,
            method: method.to_string(),
            token: generate_registration_token(),
            client: self.client_id.clone(),
        };

        let resp = self.backend.request_code(&req).await?;
        if resp.status == "ok" {
            info!("verification code sent via {method}");
            Ok(())
        } else {
            let reason = resp.reason.unwrap_or_else(|| "unknown error".into());
            Err(WlError::Authentication(format!("registration failed: {reason}")))
        }
    }

    /// Redeem a verification code for login credentials and persist them.
    pub async fn verify_code(&self, phone: &str, code: &str) -> WlResult<()> {
        if !validate_phone_number(phone) {
            return Err(WlError::BadParam(format!("invalid phone number: {phone}")));
        }
        if code.len() < 4 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(WlError::BadParam(format!("invalid verification code: {code}")));
        }

        let (cc, number) = split_phone(phone);
        let req = RegisterRequest {
            cc,
            number,
            code: code.to_string(),
            client: self.client_id.clone(),
        };

        let resp = self.backend.register(&req).await?;
        if resp.status != "ok" {
            let reason = resp.reason.unwrap_or_else(|| "unknown error".into());
            return Err(WlError::Authentication(format!("verification failed: {reason}")));
        }

        let credentials = Credentials {
            identity: normalize_phone_number(phone),
            login_token: resp.login.unwrap_or_default(),
            chat_domain: resp
                .chat_dns_domain
                .unwrap_or_else(|| self.registration_server.clone()),
            edge_routing_info: resp.edge_routing_info.unwrap_or_default(),
            expiration: unix_now() + resp.ttl.unwrap_or(constants::DEFAULT_CREDENTIAL_TTL_SECS),
        };

        let mut store = self.store.lock().await;
        store.set(credentials)?;
        info!("verification successful, credentials stored");
        Ok(())
    }

    /// Exchange stored credentials for a fresh session.
    ///
    /// Fails with an authentication error when credentials are absent or
    /// locally expired, without touching the network. Transient network
    /// failures are retried with exponential backoff; server-reported
    /// rejections are surfaced immediately.
    pub async fn login(&self) -> WlResult<()> {
        let (request, server) = {
            let store = self.store.lock().await;
            let creds = store
                .get()
                .filter(|c| !c.login_token.is_empty())
                .ok_or_else(|| {
                    WlError::Authentication("no login credentials available".into())
                })?;

            if creds.is_expired(unix_now()) {
                return Err(WlError::Authentication(
                    "login credentials have expired, re-registration required".into(),
                ));
            }

            let server = if creds.chat_domain.is_empty() {
                self.registration_server.clone()
            } else {
                creds.chat_domain.clone()
            };
            let request = LoginRequest {
                credentials: creds.login_token.clone(),
                device_id: self.client_id.clone(),
                protocol_version: self.protocol_version.clone(),
            };
            (request, server)
        };

        let mut attempt: u32 = 0;
        let resp = loop {
            match self.backend.login(&server, &request).await {
                Ok(resp) => break resp,
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        "login attempt {attempt}/{} failed ({e}), retrying in {:.1}s",
                        self.retry.max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        if resp.status != "ok" {
            let reason = resp.reason.unwrap_or_else(|| "unknown error".into());
            if reason == "bad_param" {
                let param = resp.param_name.unwrap_or_else(|| "unknown parameter".into());
                return Err(WlError::BadParam(format!("invalid parameter: {param}")));
            }
            return Err(WlError::Authentication(format!("login failed: {reason}")));
        }

        let session = Session {
            session_id: resp.session_id.unwrap_or_default(),
            session_key: resp.session_key.unwrap_or_default(),
            server_id: resp.server_id.unwrap_or_default(),
            expiration: unix_now() + resp.ttl.unwrap_or(constants::DEFAULT_SESSION_TTL_SECS),
        };
        *self.session.lock().await = Some(session);

        // Token rotation: persist the refreshed credential immediately.
        if let Some(refresh_token) = resp.refresh_token {
            let mut store = self.store.lock().await;
            if let Some(creds) = store.get().cloned() {
                let rotated = Credentials {
                    login_token: refresh_token,
                    expiration: unix_now()
                        + resp
                            .refresh_ttl
                            .unwrap_or(constants::DEFAULT_CREDENTIAL_TTL_SECS),
                    ..creds
                };
                store.set(rotated)?;
                debug!("login token rotated");
            }
        }

        info!("login successful");
        Ok(())
    }

    /// Ensure a session valid for more than the safety margin, logging in
    /// again when needed.
    pub async fn refresh_session(&self) -> WlResult<()> {
        if let Some(session) = self.session.lock().await.as_ref() {
            if session.remaining(unix_now()) > constants::SESSION_REFRESH_MARGIN_SECS {
                return Ok(());
            }
        }
        debug!("session missing or near expiry, logging in");
        self.login().await
    }

    /// Best-effort remote invalidation; local state is always cleared.
    pub async fn logout(&self) -> WlResult<()> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            debug!("not logged in, nothing to log out from");
            return Ok(());
        };

        // The session was already taken out, so derive the target from it;
        // chat_server() would no longer see the issued server.
        let server = if session.server_id.is_empty() {
            self.chat_server().await
        } else {
            session.server_id.clone()
        };
        let req = LogoutRequest {
            session_id: session.session_id,
        };
        if let Err(e) = self.backend.logout(&server, &req).await {
            warn!("remote logout failed (already logged out locally): {e}");
        } else {
            info!("logout successful");
        }
        Ok(())
    }

    /// Drop the current session without a remote call.
    ///
    /// Used when the server itself reports the session expired; the next
    /// refresh will log in again.
    pub async fn invalidate(&self) {
        *self.session.lock().await = None;
    }

    /// Whether a session exists and its expiration is strictly in the future.
    ///
    /// An expired session is cleared as a side effect (lazy invalidation).
    pub async fn is_authenticated(&self) -> bool {
        let mut session = self.session.lock().await;
        match session.as_ref() {
            Some(s) if s.is_valid(unix_now()) => true,
            Some(_) => {
                debug!("session expired, clearing");
                *session = None;
                false
            }
            None => false,
        }
    }
}

/// Split a phone number into (country code, local number).
fn split_phone(phone: &str) -> (String, String) {
    let digits = normalize_phone_number(phone);
    // Longest-prefix match over common country codes; falls back to 1.
    for cc in ["44", "49", "33", "34", "39", "52", "55", "91", "7", "1"] {
        if digits.starts_with(cc) {
            return (cc.to_string(), digits[cc.len()..].to_string());
        }
    }
    ("1".to_string(), digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CodeResponse, LoginResponse, RegisterResponse};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted backend: counts calls and pops canned login results.
    struct StubBackend {
        login_calls: AtomicU32,
        logout_calls: AtomicU32,
        logout_server: Mutex<Option<String>>,
        login_script: Mutex<Vec<WlResult<LoginResponse>>>,
        logout_result: fn() -> WlResult<()>,
    }

    impl StubBackend {
        fn new(script: Vec<WlResult<LoginResponse>>) -> Self {
            Self {
                login_calls: AtomicU32::new(0),
                logout_calls: AtomicU32::new(0),
                logout_server: Mutex::new(None),
                login_script: Mutex::new(script),
                logout_result: || Ok(()),
            }
        }

        fn failing_logout(script: Vec<WlResult<LoginResponse>>) -> Self {
            Self {
                logout_result: || Err(WlError::Connection("unreachable".into())),
                ..Self::new(script)
            }
        }

        fn ok_response(ttl: i64) -> LoginResponse {
            LoginResponse {
                status: "ok".into(),
                reason: None,
                param_name: None,
                session_id: Some("sess-1".into()),
                session_key: Some("key-1".into()),
                server_id: Some("edge-7.example.com".into()),
                ttl: Some(ttl),
                refresh_token: None,
                refresh_ttl: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl AuthBackend for StubBackend {
        async fn request_code(&self, _req: &CodeRequest) -> WlResult<CodeResponse> {
            Ok(CodeResponse {
                status: "ok".into(),
                reason: None,
            })
        }

        async fn register(&self, _req: &RegisterRequest) -> WlResult<RegisterResponse> {
            Ok(RegisterResponse {
                status: "ok".into(),
                reason: None,
                login: Some("fresh-token".into()),
                ttl: Some(3600),
                chat_dns_domain: Some("chat.test".into()),
                edge_routing_info: None,
            })
        }

        async fn login(&self, _server: &str, _req: &LoginRequest) -> WlResult<LoginResponse> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.login_script.lock().await;
            if script.is_empty() {
                Ok(Self::ok_response(3600))
            } else {
                script.remove(0)
            }
        }

        async fn logout(&self, server: &str, _req: &LogoutRequest) -> WlResult<()> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            *self.logout_server.lock().await = Some(server.to_string());
            (self.logout_result)()
        }
    }

    fn store_with(expiration: i64, dir: &tempfile::TempDir) -> CredentialStore {
        let mut store = CredentialStore::load(dir.path().join("creds.json")).unwrap();
        store
            .set(Credentials {
                identity: "15551234567".into(),
                login_token: "tok".into(),
                chat_domain: "chat.test".into(),
                edge_routing_info: String::new(),
                expiration,
            })
            .unwrap();
        store
    }

    fn manager(backend: Arc<StubBackend>, store: CredentialStore) -> SessionManager {
        SessionManager::new(backend, store, "chat.test", "2.2410.0").with_retry_config(
            LoginRetryConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_login_success() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.login().await.unwrap();
        assert!(mgr.is_authenticated().await);
        assert_eq!(mgr.session().await.unwrap().session_id, "sess-1");
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_credentials_fail_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        // Expired one second ago.
        let mgr = manager(backend.clone(), store_with(unix_now() - 1, &dir));

        let err = mgr.login().await.unwrap_err();
        assert!(matches!(err, WlError::Authentication(_)));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("creds.json")).unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend.clone(), store);

        assert!(matches!(
            mgr.login().await,
            Err(WlError::Authentication(_))
        ));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![
            Err(WlError::Connection("reset".into())),
            Err(WlError::Timeout("deadline".into())),
        ]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.login().await.unwrap();
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bad_param_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![Ok(LoginResponse {
            status: "error".into(),
            reason: Some("bad_param".into()),
            param_name: Some("protocol_version".into()),
            session_id: None,
            session_key: None,
            server_id: None,
            ttl: None,
            refresh_token: None,
            refresh_ttl: None,
        })]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        let err = mgr.login().await.unwrap_err();
        assert!(matches!(err, WlError::BadParam(_)));
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_token_rotation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![Ok(LoginResponse {
            refresh_token: Some("rotated-token".into()),
            refresh_ttl: Some(7200),
            ..StubBackend::ok_response(3600)
        })]));
        let path = dir.path().join("creds.json");
        let mut store = CredentialStore::load(&path).unwrap();
        store
            .set(Credentials {
                identity: "15551234567".into(),
                login_token: "old-token".into(),
                chat_domain: "chat.test".into(),
                edge_routing_info: String::new(),
                expiration: unix_now() + 3600,
            })
            .unwrap();
        let mgr = manager(backend, store);

        mgr.login().await.unwrap();

        let reloaded = CredentialStore::load(&path).unwrap();
        assert_eq!(reloaded.get().unwrap().login_token, "rotated-token");
    }

    #[tokio::test]
    async fn test_refresh_session_noop_when_valid() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.login().await.unwrap();
        mgr.refresh_session().await.unwrap();
        // Session was valid for well over the margin, no second login.
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_is_authenticated_lazy_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![Ok(StubBackend::ok_response(-1))]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        // Session comes back already expired (ttl -1).
        mgr.login().await.unwrap();
        assert!(!mgr.is_authenticated().await);
        // Lazy invalidation cleared it, no network involved.
        assert!(mgr.session().await.is_none());
        assert_eq!(backend.login_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_clears_even_on_remote_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::failing_logout(vec![]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.login().await.unwrap();
        mgr.logout().await.unwrap();
        assert!(!mgr.is_authenticated().await);
        assert!(mgr.session().await.is_none());
        assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_targets_session_server() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.login().await.unwrap();
        mgr.logout().await.unwrap();

        // The issued server receives the logout, not the credential domain.
        assert_eq!(
            backend.logout_server.lock().await.as_deref(),
            Some("edge-7.example.com")
        );
    }

    #[tokio::test]
    async fn test_logout_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend.clone(), store_with(unix_now() + 3600, &dir));

        mgr.logout().await.unwrap();
        mgr.logout().await.unwrap();
        assert_eq!(backend.logout_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_method() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend, store_with(unix_now() + 3600, &dir));

        assert!(matches!(
            mgr.register("+15551234567", "carrier-pigeon").await,
            Err(WlError::BadParam(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_code_persists_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let store = CredentialStore::load(&path).unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend, store);

        mgr.verify_code("+15551234567", "123456").await.unwrap();

        let reloaded = CredentialStore::load(&path).unwrap();
        let creds = reloaded.get().unwrap();
        assert_eq!(creds.login_token, "fresh-token");
        assert_eq!(creds.chat_domain, "chat.test");
    }

    #[tokio::test]
    async fn test_verify_code_rejects_short_code() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend, store_with(unix_now() + 3600, &dir));

        assert!(matches!(
            mgr.verify_code("+15551234567", "12").await,
            Err(WlError::BadParam(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_server_prefers_session_server() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(StubBackend::new(vec![]));
        let mgr = manager(backend, store_with(unix_now() + 3600, &dir));

        assert_eq!(mgr.chat_server().await, "chat.test");
        mgr.login().await.unwrap();
        assert_eq!(mgr.chat_server().await, "edge-7.example.com");
    }

    #[test]
    fn test_split_phone() {
        assert_eq!(split_phone("+15551234567"), ("1".into(), "5551234567".into()));
        assert_eq!(split_phone("+447911123456"), ("44".into(), "7911123456".into()));
    }
}
