//! Error taxonomy shared by the supervisor, control channel and probes

use thiserror::Error;

/// Errors from supervising and talking to the Tor daemon
#[derive(Debug, Error)]
pub enum WardenError {
    /// Invalid ports, unusable secret, malformed config file
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Daemon failed to bootstrap in time, or its ports stayed bound after cleanup
    #[error("Launch failed: {0}")]
    Launch(String),

    /// The daemon rejected the control secret
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// A command was issued before the session authenticated
    #[error("Control session is not authenticated")]
    Unauthenticated,

    /// The session's daemon stopped, or the channel broke; reconnect before retrying
    #[error("Control session is no longer valid")]
    SessionInvalid,

    /// Network-level failure on a probe or the control channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// The daemon answered with something we could not interpret
    #[error("Control protocol error: {0}")]
    Protocol(String),

    /// NEWNYM was accepted but the exit address did not change
    #[error("Identity rotation did not change the exit address ({0})")]
    RotationFailure(String),

    /// Routed and direct paths report the same address
    #[error("LEAK DETECTED: routed and direct traffic both appear as {0}")]
    LeakDetected(String),

    #[error("Tor daemon is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Tor daemon is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// True for the three conditions grouped as "authentication errors":
    /// rejected secret, missing authentication, stale session
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            WardenError::AuthenticationRejected(_)
                | WardenError::Unauthenticated
                | WardenError::SessionInvalid
        )
    }

    /// Errors after which a control session must not be reused
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            WardenError::Transport(_) | WardenError::Io(_) | WardenError::SessionInvalid
        )
    }
}

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_grouping() {
        assert!(WardenError::Unauthenticated.is_authentication());
        assert!(WardenError::SessionInvalid.is_authentication());
        assert!(WardenError::AuthenticationRejected("bad".into()).is_authentication());
        assert!(!WardenError::Transport("reset".into()).is_authentication());
    }

    #[test]
    fn test_leak_message_is_prominent() {
        let err = WardenError::LeakDetected("1.2.3.4".into());
        assert!(err.to_string().starts_with("LEAK DETECTED"));
    }
}
