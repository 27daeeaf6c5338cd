//! Status aggregation
//!
//! A snapshot holds the supervisor's read guard from the first probe to the
//! last, so a concurrent stop waits and the report never mixes a running
//! and a torn-down daemon.

use tracing::{debug, warn};

use warden_core::{Connectivity, StatusInputs, StatusReport, LOCALHOST};
use warden_tor::port_reachable;

use crate::{probe_connectivity, Warden};

/// Composes one report from supervisor, control channel and probes
pub struct StatusAggregator<'a> {
    warden: &'a Warden,
}

impl<'a> StatusAggregator<'a> {
    pub fn new(warden: &'a Warden) -> Self {
        Self { warden }
    }

    pub async fn snapshot(&self) -> StatusReport {
        let proxy = &self.warden.config().proxy;
        let probe = self.warden.probe();
        let port_timeout = probe.settings().port_timeout();

        let guard = self.warden.supervisor().lifecycle().await;
        let lifecycle = guard.lifecycle();
        let handle = guard.running_handle().cloned();
        let pid = guard.handle().and_then(|h| h.pid);

        let (socks_reachable, control_reachable) = tokio::join!(
            port_reachable(LOCALHOST, proxy.socks_port, port_timeout),
            port_reachable(LOCALHOST, proxy.control_port, port_timeout),
        );

        let connectivity = if socks_reachable {
            probe_connectivity(probe).await
        } else {
            Connectivity::NotAttempted {
                reason: format!("SOCKS port {} is not reachable", proxy.socks_port),
            }
        };

        let circuit_count = match &handle {
            Some(handle) if control_reachable => match self.warden.circuits_for(handle).await {
                Ok(circuits) => Some(circuits.len()),
                Err(e) => {
                    warn!("Circuit count unavailable: {}", e);
                    None
                },
            },
            _ => None,
        };

        let geolocation = match &connectivity {
            Connectivity::Tested { routed, .. } if probe.settings().geolocation => {
                match routed.observed_address.as_deref() {
                    Some(address) => probe.geolocate(address).await,
                    None => None,
                }
            },
            _ => None,
        };

        drop(guard);

        let report = StatusReport::compose(StatusInputs {
            lifecycle,
            pid,
            socks_port: proxy.socks_port,
            control_port: proxy.control_port,
            socks_reachable,
            control_reachable,
            connectivity,
            circuit_count,
            geolocation,
        });

        debug!("Status snapshot: {}", report.overall);
        report
    }
}
