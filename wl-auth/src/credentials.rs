//! Durable storage for long-lived login credentials.
//!
//! Credentials are issued at registration/verification time and rotated when
//! the server hands back a refresh token at login. Every mutation is
//! persisted to disk immediately so a process restart never loses a usable
//! login token.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use wl_core::error::WlResult;

/// Long-lived login credentials for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account identity (normalized phone number).
    pub identity: String,
    /// Opaque login token presented at login.
    pub login_token: String,
    /// Chat server domain issued at registration.
    pub chat_domain: String,
    /// Opaque routing hint issued at registration.
    #[serde(default)]
    pub edge_routing_info: String,
    /// Absolute expiration, unix seconds.
    pub expiration: i64,
}

impl Credentials {
    /// Whether these credentials have expired as of `now` (unix seconds).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration <= now
    }
}

/// On-disk store for [`Credentials`].
///
/// The file holds a single JSON object; a missing file means no credentials.
pub struct CredentialStore {
    path: PathBuf,
    credentials: Option<Credentials>,
}

impl CredentialStore {
    /// Open the store at `path`, loading existing credentials if present.
    pub fn load(path: impl Into<PathBuf>) -> WlResult<Self> {
        let path = path.into();
        let credentials = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(creds) => {
                    debug!("loaded credentials from {}", path.display());
                    Some(creds)
                }
                Err(e) => {
                    warn!("ignoring unreadable credentials file {}: {e}", path.display());
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { path, credentials })
    }

    /// The current credentials, if any.
    pub fn get(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Replace the stored credentials and persist immediately.
    pub fn set(&mut self, credentials: Credentials) -> WlResult<()> {
        self.credentials = Some(credentials);
        self.save()
    }

    /// Drop the stored credentials and remove the file.
    pub fn clear(&mut self) -> WlResult<()> {
        self.credentials = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Whether usable (present and unexpired) credentials exist.
    pub fn is_usable(&self, now: i64) -> bool {
        self.credentials
            .as_ref()
            .map(|c| !c.login_token.is_empty() && !c.is_expired(now))
            .unwrap_or(false)
    }

    /// Path backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> WlResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.credentials)?;
        std::fs::write(&self.path, contents)?;
        debug!("saved credentials to {}", self.path.display());
        Ok(())
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}
