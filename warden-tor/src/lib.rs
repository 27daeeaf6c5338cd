//! Tor Warden Tor Layer
//!
//! Everything that talks to the daemon or through it:
//! - Control port sessions (authenticate, signal, query circuits)
//! - Daemon process supervision and control secret hashing
//! - SOCKS5h HTTP clients and connectivity/leak probes
//! - Identity rotation with observed-address verification

pub mod control;
pub mod hashing;
pub mod identity;
mod os;
pub mod probe;
pub mod proxy;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use control::*;
pub use hashing::*;
pub use identity::*;
pub use probe::*;
pub use proxy::*;
pub use supervisor::*;
