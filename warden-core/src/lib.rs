//! Tor Warden Core - domain model for supervising a local Tor daemon
//!
//! This crate provides the foundational types shared by every layer:
//! - Proxy configuration with TOML loading and validation
//! - Process lifecycle and control-channel liveness
//! - Circuit and identity snapshots
//! - Status reports and health classification
//! - The error taxonomy

pub mod config;
pub mod error;
pub mod model;
pub mod status;

pub use config::*;
pub use error::*;
pub use model::*;
pub use status::*;

/// Default SOCKS port of the supervised daemon
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port of the supervised daemon
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Loopback host every local probe targets
pub const LOCALHOST: &str = "127.0.0.1";
