//! Waveline Auth - credential persistence and session lifecycle.
//!
//! This crate provides:
//! - Durable storage for long-lived login credentials
//! - The session manager (login, refresh, logout, validity tracking)
//! - The HTTP client for the registration/login collaborator, behind the
//!   `AuthBackend` trait so session logic is testable without a network

pub mod api;
pub mod credentials;
pub mod session;

// Re-export key types
pub use api::{AuthBackend, HttpAuthApi, LoginRequest, LoginResponse};
pub use credentials::{CredentialStore, Credentials};
pub use session::{Session, SessionManager};
