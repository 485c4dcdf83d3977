//! Waveline Core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by all other Waveline crates:
//! - Application configuration (server domain, connection tuning, paths)
//! - Global error types covering all error categories
//! - Structured logging with tracing
//! - Recipient/JID utilities
//! - Common constants

pub mod config;
pub mod constants;
pub mod error;
pub mod jid;
pub mod logging;

// Re-export commonly used items at the crate root
pub use config::AppConfig;
pub use error::{WlError, WlResult};
pub use logging::init_logging;
