//! # Floodgate Common Library
//!
//! Shared code for the floodgate service:
//! - Request admission: sliding windows and the security engine
//! - Event types, the per-stream event log and SSE broadcasting
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod request;
pub mod security;
pub mod sse;
pub mod window;

pub use error::{Error, Result};
