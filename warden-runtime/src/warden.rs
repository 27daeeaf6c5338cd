//! Warden coordinator
//!
//! Owns exactly one supervisor and at most one control session:
//! - start, attach and stop go through the supervisor's exclusive lock
//! - rotation, circuit queries and probes hold its shared lock throughout
//! - the session is bound to the running handle and rebuilt when stale

use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use warden_core::{
    Circuit, Connectivity, ProcessHandle, Result, RotationOutcome, StatusReport, WardenConfig,
    WardenError, LOCALHOST,
};
use warden_tor::{
    port_reachable, ConnectivityProbe, ControlSession, IdentityController, ProcessSupervisor,
};

use crate::StatusAggregator;

/// Single owner of the supervised daemon and its control session
pub struct Warden {
    config: WardenConfig,
    supervisor: ProcessSupervisor,
    session: Mutex<Option<ControlSession>>,
    probe: ConnectivityProbe,
}

impl Warden {
    /// Validate ports and build the probe clients. The control secret is
    /// checked only when launching or authenticating, so probes run without it.
    pub fn new(config: WardenConfig) -> Result<Self> {
        config.proxy.validate_endpoints()?;
        let probe = ConnectivityProbe::new(&config.proxy, config.probe.clone())?;
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());

        Ok(Self {
            config,
            supervisor,
            session: Mutex::new(None),
            probe,
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn probe(&self) -> &ConnectivityProbe {
        &self.probe
    }

    /// Launch the daemon and wait for bootstrap
    pub async fn start(&self) -> Result<ProcessHandle> {
        let handle = self.supervisor.start(&self.config.proxy).await?;
        self.session.lock().await.take();
        Ok(handle)
    }

    /// Adopt a daemon already serving the configured control port
    pub async fn attach(&self) -> Result<Option<ProcessHandle>> {
        self.supervisor.attach(&self.config.proxy).await
    }

    /// Close the session, then stop the daemon. Safe to repeat.
    pub async fn stop(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.supervisor.stop().await
    }

    /// Leave a launched daemon running after this process exits
    pub async fn release(&self) -> Option<PathBuf> {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.supervisor.release().await
    }

    pub async fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy().await
    }

    /// Fresh status report
    pub async fn snapshot(&self) -> StatusReport {
        StatusAggregator::new(self).snapshot().await
    }

    /// Request a new identity and verify the exit address changed.
    /// `changed == false` is returned as a value; see `ensure_changed`.
    pub async fn rotate(&self) -> Result<RotationOutcome> {
        let guard = self.supervisor.lifecycle().await;
        let handle = guard.running_handle().cloned().ok_or(WardenError::NotRunning)?;

        let mut slot = self.session.lock().await;
        let session = self.session_for(&mut slot, &handle).await?;

        let outcome = IdentityController::new(&self.probe).rotate(session).await;
        if let Err(e) = &outcome {
            discard_if_broken(&mut slot, e);
        }
        drop(guard);
        outcome
    }

    /// Built circuits of the running daemon
    pub async fn circuits(&self) -> Result<Vec<Circuit>> {
        let guard = self.supervisor.lifecycle().await;
        let handle = guard.running_handle().cloned().ok_or(WardenError::NotRunning)?;
        let circuits = self.circuits_for(&handle).await;
        drop(guard);
        circuits
    }

    /// Routed and leak checks, or "not attempted" when the SOCKS port is closed
    pub async fn test_connectivity(&self) -> Connectivity {
        let _guard = self.supervisor.lifecycle().await;
        let socks_port = self.config.proxy.socks_port;
        if port_reachable(LOCALHOST, socks_port, self.probe.settings().port_timeout()).await {
            probe_connectivity(&self.probe).await
        } else {
            Connectivity::NotAttempted {
                reason: format!("SOCKS port {} is not reachable", socks_port),
            }
        }
    }

    /// Circuit query for a handle taken from a guard the caller already holds
    pub(crate) async fn circuits_for(&self, handle: &ProcessHandle) -> Result<Vec<Circuit>> {
        let mut slot = self.session.lock().await;
        let session = self.session_for(&mut slot, handle).await?;

        let circuits = session.query_circuits().await;
        if let Err(e) = &circuits {
            discard_if_broken(&mut slot, e);
        }
        circuits
    }

    /// Reuse the current session if it is still usable for this run,
    /// otherwise authenticate a new one bound to `handle`
    async fn session_for<'s>(
        &self,
        slot: &'s mut Option<ControlSession>,
        handle: &ProcessHandle,
    ) -> Result<&'s mut ControlSession> {
        if !slot.as_ref().is_some_and(ControlSession::is_usable) {
            let proxy = &self.config.proxy;
            proxy.require_secret()?;
            debug!("Opening control session on port {}", proxy.control_port);
            let mut session = ControlSession::connect(
                proxy.control_port,
                &proxy.control_secret,
                self.supervisor.settings().control_timeout(),
            )
            .await?;
            session.bind(handle.liveness());
            info!("Control session established");
            *slot = Some(session);
        }
        slot.as_mut().ok_or(WardenError::SessionInvalid)
    }
}

fn discard_if_broken(slot: &mut Option<ControlSession>, error: &WardenError) {
    if error.invalidates_session() {
        warn!("Dropping control session after: {}", error);
        *slot = None;
    }
}

/// Run the routed and leak probes concurrently
pub async fn probe_connectivity(probe: &ConnectivityProbe) -> Connectivity {
    let (routed, leak) = tokio::join!(probe.test_routed(), probe.test_leak());
    Connectivity::Tested { routed, leak }
}
