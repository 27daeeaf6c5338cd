//! Identity rotation
//!
//! Rotation is verified, not assumed: the exit address is observed before
//! and after NEWNYM and the outcome says whether it actually changed.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use warden_core::{IdentitySnapshot, Result, RotationOutcome};

use crate::{ConnectivityProbe, ControlSession};

/// Something that can report the current exit address
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn observed_address(&self) -> Result<String>;
}

/// Something that can request fresh circuits
#[async_trait]
pub trait IdentitySignal: Send {
    async fn new_identity(&mut self) -> Result<()>;
}

#[async_trait]
impl AddressLookup for ConnectivityProbe {
    async fn observed_address(&self) -> Result<String> {
        ConnectivityProbe::observed_address(self).await
    }
}

#[async_trait]
impl IdentitySignal for ControlSession {
    async fn new_identity(&mut self) -> Result<()> {
        ControlSession::new_identity(self).await
    }
}

/// Drives one verified rotation at a time
pub struct IdentityController<'a, L: AddressLookup> {
    lookup: &'a L,
    settle: Duration,
}

impl<'a, L: AddressLookup> IdentityController<'a, L> {
    /// Wait between the signal and the second observation. Tor rate-limits
    /// NEWNYM and needs time to build the new circuits.
    pub const SETTLE_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(lookup: &'a L) -> Self {
        Self {
            lookup,
            settle: Self::SETTLE_INTERVAL,
        }
    }

    /// Override the wait after NEWNYM
    pub fn with_settle_interval(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Observe, signal, settle, observe again. Signal errors propagate;
    /// a failed observation just leaves that side unknown.
    pub async fn rotate<S: IdentitySignal + ?Sized>(&self, signal: &mut S) -> Result<RotationOutcome> {
        let previous = self.snapshot().await;

        signal.new_identity().await?;
        tokio::time::sleep(self.settle).await;

        let current = self.snapshot().await;
        let outcome = RotationOutcome::between(previous, current);

        if outcome.changed {
            info!(
                "Identity rotated: {} -> {}",
                outcome.previous.address.as_deref().unwrap_or("?"),
                outcome.current.address.as_deref().unwrap_or("?")
            );
        } else {
            warn!("Exit address did not change after NEWNYM");
        }
        Ok(outcome)
    }

    async fn snapshot(&self) -> IdentitySnapshot {
        match self.lookup.observed_address().await {
            Ok(address) => IdentitySnapshot::capture(Some(address)),
            Err(e) => {
                warn!("Could not observe exit address: {}", e);
                IdentitySnapshot::capture(None)
            },
        }
    }
}
