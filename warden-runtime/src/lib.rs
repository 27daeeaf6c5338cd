//! Tor Warden Runtime
//!
//! Ties the supervisor, the single control session and the probes together
//! under one owner, and composes status reports from them.

pub mod status;
pub mod warden;

pub use status::*;
pub use warden::*;
