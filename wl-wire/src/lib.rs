//! Waveline Wire - frame codec, payload builders, and callback registry.
//!
//! This crate provides:
//! - The length-prefixed JSON frame codec used on the chat connection
//! - Typed builders for every outbound payload shape
//! - The callback registry that routes inbound frames to user handlers

pub mod frame;
pub mod payload;
pub mod registry;

// Re-export key types
pub use frame::{decode, encode, Frame, FrameTag};
pub use registry::{CallbackCategory, CallbackRegistry, Dispatch};
