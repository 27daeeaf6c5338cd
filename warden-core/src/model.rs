//! Process, circuit and identity model

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, WardenError};

/// Lifecycle of the supervised daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    NotStarted,
    Launching,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Lifecycle {
    pub fn is_running(self) -> bool {
        self == Lifecycle::Running
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::NotStarted => "not started",
            Lifecycle::Launching => "launching",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the supervisor came to track a daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOrigin {
    /// Spawned by this supervisor
    Launched,
    /// Found on the configured control port and authenticated
    Adopted,
}

/// Shared flag tying control sessions to one daemon run.
///
/// The supervisor holds the writer side; every session bound to the run
/// checks it before sending a command.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate every session bound to this run
    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// The daemon process the supervisor currently tracks
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    /// Launch time, or the time an existing daemon was adopted
    pub started_at: DateTime<Utc>,
    pub state: Lifecycle,
    pub origin: ProcessOrigin,
    #[serde(skip)]
    liveness: Liveness,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, origin: ProcessOrigin) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            state: Lifecycle::Launching,
            origin,
            liveness: Liveness::new(),
        }
    }

    /// Token for binding control sessions to this run
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Move to a new lifecycle state; leaving Running revokes bound sessions
    pub fn transition(&mut self, state: Lifecycle) {
        if state != Lifecycle::Running {
            self.liveness.revoke();
        }
        self.state = state;
    }
}

/// Build state of a circuit as reported by the control port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Building,
    Built,
    Failed,
    Closed,
}

impl CircuitStatus {
    /// Map a control-protocol status keyword. EXTENDED and LAUNCHED are
    /// intermediate build steps; GUARD_WAIT circuits are built but held back.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "LAUNCHED" | "EXTENDED" | "GUARD_WAIT" => Some(CircuitStatus::Building),
            "BUILT" => Some(CircuitStatus::Built),
            "FAILED" => Some(CircuitStatus::Failed),
            "CLOSED" => Some(CircuitStatus::Closed),
            _ => None,
        }
    }
}

/// One hop of a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Hex identity fingerprint, without the leading `$`
    pub fingerprint: String,
    pub nickname: Option<String>,
    pub country: Option<String>,
}

/// A circuit snapshot; fetched fresh for every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: String,
    pub status: CircuitStatus,
    /// Hops in order, guard first
    pub path: Vec<RelayDescriptor>,
    /// PURPOSE tag, e.g. GENERAL or HS_CLIENT_REND
    pub purpose: Option<String>,
}

/// Exit address seen by the outside world at one moment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub address: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl IdentitySnapshot {
    pub fn capture(address: Option<String>) -> Self {
        Self {
            address,
            captured_at: Utc::now(),
        }
    }
}

/// Result of one identity rotation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationOutcome {
    pub changed: bool,
    pub previous: IdentitySnapshot,
    pub current: IdentitySnapshot,
}

impl RotationOutcome {
    /// Changed only if both addresses were observed and they differ
    pub fn between(previous: IdentitySnapshot, current: IdentitySnapshot) -> Self {
        let changed = match (&previous.address, &current.address) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        };
        Self {
            changed,
            previous,
            current,
        }
    }

    /// Turn an unchanged address into a RotationFailure
    pub fn ensure_changed(self) -> Result<Self> {
        if self.changed {
            return Ok(self);
        }
        let seen = self
            .current
            .address
            .clone()
            .unwrap_or_else(|| "address unknown".to_string());
        Err(WardenError::RotationFailure(seen))
    }
}
