//! Waveline Client - the high-level client facade.
//!
//! This crate ties the auth, wire, and socket layers together into
//! [`WavelineClient`], and adds the two collaborators the facade needs: the
//! media upload/download client and the payload cipher.

pub mod client;
pub mod crypto;
pub mod media;

// Re-export key types
pub use client::WavelineClient;
pub use crypto::PayloadCipher;
pub use media::{MediaClient, MediaUpload};
