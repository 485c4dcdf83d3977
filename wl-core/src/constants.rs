//! Application-wide constants.

/// Application name.
pub const APP_NAME: &str = "Waveline";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default chat server domain when none is configured or issued.
pub const DEFAULT_SERVER: &str = "chat.waveline.example";

/// REST API version prefix for the auth collaborator.
pub const API_VERSION: &str = "v1";

/// Protocol version reported at login.
pub const PROTOCOL_VERSION: &str = "2.2410.0";

/// Login request timeout in seconds.
pub const LOGIN_TIMEOUT_SECS: u64 = 30;

/// Handshake wait for the persistent connection, in seconds.
pub const CONN_TIMEOUT_SECS: u64 = 15;

/// Maximum connection attempts before surfacing a connection error.
pub const RETRY_MAX: u32 = 3;

/// Session validity margin: refresh when less than this many seconds remain.
pub const SESSION_REFRESH_MARGIN_SECS: i64 = 300;

/// Default session lifetime when the server omits a ttl, in seconds.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3_600;

/// Default credential lifetime when the server omits a ttl, in seconds.
pub const DEFAULT_CREDENTIAL_TTL_SECS: i64 = 31_536_000;

/// Frame type codes carried in the wire envelope.
pub mod frame_types {
    pub const TEXT: u32 = 0;
    pub const MEDIA: u32 = 1;
    pub const LOCATION: u32 = 2;
    pub const CONTACT: u32 = 3;
    pub const GROUP: u32 = 5;
    pub const PRESENCE: u32 = 6;
}

/// Media type codes carried inside media frames.
pub mod media_types {
    pub const IMAGE: u32 = 1;
    pub const VIDEO: u32 = 2;
    pub const AUDIO: u32 = 3;
    pub const DOCUMENT: u32 = 4;
    pub const STICKER: u32 = 5;
}

/// Group command strings.
pub mod group_commands {
    pub const CREATE: &str = "create";
    pub const LEAVE: &str = "leave";
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const SUBJECT: &str = "subject";
}

/// Presence and chat-state strings.
pub mod presence {
    pub const ONLINE: &str = "available";
    pub const OFFLINE: &str = "unavailable";
    pub const TYPING: &str = "composing";
    pub const RECORDING: &str = "recording";
    pub const PAUSED: &str = "paused";

    /// All valid presence strings.
    pub const ALL: &[&str] = &[ONLINE, OFFLINE, TYPING, RECORDING, PAUSED];
}
