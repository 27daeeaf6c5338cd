//! Status reports and health classification
//!
//! A [`StatusReport`] is rebuilt from scratch for every request. Each check
//! contributes a [`HealthLevel`] on its own and the worst one wins.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Lifecycle, WardenError};

/// Overall health, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    /// Process exit code: 0 healthy, 1 degraded, 2 unhealthy
    pub fn exit_code(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Result of a request routed through the SOCKS port to the anonymity check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedResult {
    pub success: bool,
    /// The check endpoint confirmed the request arrived via Tor
    pub is_confirmed_routed: bool,
    pub observed_address: Option<String>,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoutedResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            is_confirmed_routed: false,
            observed_address: None,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Comparison of the routed and direct exit addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakResult {
    pub leak_detected: bool,
    pub routed_address: Option<String>,
    pub direct_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LeakResult {
    /// A leak is two observed addresses that are identical. Traffic sent
    /// through the proxy must not leave from the same address as direct traffic.
    pub fn compare(routed: Option<String>, direct: Option<String>) -> Self {
        let leak_detected = match (&routed, &direct) {
            (Some(r), Some(d)) => normalize_address(r) == normalize_address(d),
            _ => false,
        };
        let error = match (&routed, &direct) {
            (None, _) => Some("routed address unavailable".to_string()),
            (_, None) => Some("direct address unavailable".to_string()),
            _ => None,
        };
        Self {
            leak_detected,
            routed_address: routed,
            direct_address: direct,
            error,
        }
    }

    /// Either side could not be observed, so nothing was compared
    pub fn is_inconclusive(&self) -> bool {
        self.routed_address.is_none() || self.direct_address.is_none()
    }

    /// Promote a detected leak to an error for callers that must stop on it
    pub fn ensure_clean(&self) -> Result<(), WardenError> {
        if !self.leak_detected {
            return Ok(());
        }
        let addr = self.routed_address.clone().unwrap_or_default();
        Err(WardenError::LeakDetected(addr))
    }
}

/// Echo services sometimes answer `"client, proxy"`; the first hop is the client
fn normalize_address(raw: &str) -> &str {
    raw.split(',').next().unwrap_or(raw).trim()
}

/// Connectivity section of a report; "not attempted" is not a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Connectivity {
    NotAttempted { reason: String },
    Tested {
        routed: RoutedResult,
        leak: LeakResult,
    },
}

impl Connectivity {
    /// Routing and leak findings; "not attempted" degrades on its own
    pub fn findings(&self) -> Vec<Finding> {
        use HealthLevel::*;

        let mut findings = Vec::new();
        match self {
            Connectivity::NotAttempted { reason } => {
                findings.push(finding(
                    "connectivity",
                    Degraded,
                    format!("Connectivity not attempted: {}", reason),
                ));
            },
            Connectivity::Tested { routed, leak } => {
                findings.push(if !routed.success {
                    finding(
                        "connectivity",
                        Unhealthy,
                        format!(
                            "Tor connectivity failed: {}",
                            routed.error.as_deref().unwrap_or("unknown error")
                        ),
                    )
                } else if !routed.is_confirmed_routed {
                    finding(
                        "connectivity",
                        Degraded,
                        "Connected but not confirmed to be using Tor".into(),
                    )
                } else {
                    finding("connectivity", Healthy, "Connected through Tor network".into())
                });

                findings.push(if leak.leak_detected {
                    finding(
                        "leak",
                        Unhealthy,
                        format!(
                            "Leak detected: routed and direct address are both {}",
                            leak.routed_address.as_deref().unwrap_or("?")
                        ),
                    )
                } else if leak.is_inconclusive() {
                    finding(
                        "leak",
                        Degraded,
                        format!(
                            "Could not test for leaks: {}",
                            leak.error.as_deref().unwrap_or("address unavailable")
                        ),
                    )
                } else {
                    finding("leak", Healthy, "No leaks detected".into())
                });
            },
        }
        findings
    }

    /// Worst level among the connectivity findings
    pub fn health(&self) -> HealthLevel {
        self.findings()
            .iter()
            .map(|f| f.level)
            .max()
            .unwrap_or(HealthLevel::Healthy)
    }
}

/// Exit location for an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub region: String,
    pub city: String,
    pub org: String,
    pub timezone: String,
}

/// One classified check, kept for human-readable rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub check: String,
    pub level: HealthLevel,
    pub detail: String,
}

/// Raw inputs to classification
#[derive(Debug, Clone)]
pub struct StatusInputs {
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub socks_port: u16,
    pub control_port: u16,
    pub socks_reachable: bool,
    pub control_reachable: bool,
    pub connectivity: Connectivity,
    pub circuit_count: Option<usize>,
    pub geolocation: Option<GeoLocation>,
}

/// Aggregate status; never mutated after construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub overall: HealthLevel,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    pub socks_port: u16,
    pub control_port: u16,
    pub socks_reachable: bool,
    pub control_reachable: bool,
    pub connectivity: Connectivity,
    pub circuit_count: Option<usize>,
    pub geolocation: Option<GeoLocation>,
    pub findings: Vec<Finding>,
}

impl StatusReport {
    /// Classify every check independently and keep the worst level
    pub fn compose(inputs: StatusInputs) -> Self {
        let findings = classify(&inputs);
        let overall = findings
            .iter()
            .map(|f| f.level)
            .max()
            .unwrap_or(HealthLevel::Healthy);

        Self {
            timestamp: Utc::now(),
            overall,
            lifecycle: inputs.lifecycle,
            pid: inputs.pid,
            socks_port: inputs.socks_port,
            control_port: inputs.control_port,
            socks_reachable: inputs.socks_reachable,
            control_reachable: inputs.control_reachable,
            connectivity: inputs.connectivity,
            circuit_count: inputs.circuit_count,
            geolocation: inputs.geolocation,
            findings,
        }
    }

    pub fn leak_detected(&self) -> bool {
        matches!(&self.connectivity, Connectivity::Tested { leak, .. } if leak.leak_detected)
    }
}

fn finding(check: &str, level: HealthLevel, detail: String) -> Finding {
    Finding {
        check: check.to_string(),
        level,
        detail,
    }
}

fn classify(inputs: &StatusInputs) -> Vec<Finding> {
    use HealthLevel::*;

    let mut findings = Vec::new();

    findings.push(if inputs.lifecycle.is_running() {
        finding("process", Healthy, "Tor process is running".into())
    } else {
        finding("process", Unhealthy, format!("Tor process is {}", inputs.lifecycle))
    });

    findings.push(if inputs.socks_reachable {
        finding("socks_port", Healthy, format!("SOCKS port ({}) is open", inputs.socks_port))
    } else {
        finding(
            "socks_port",
            Unhealthy,
            format!("SOCKS port ({}) is not accessible", inputs.socks_port),
        )
    });

    findings.push(if inputs.control_reachable {
        finding(
            "control_port",
            Healthy,
            format!("Control port ({}) is open", inputs.control_port),
        )
    } else {
        finding(
            "control_port",
            Degraded,
            format!("Control port ({}) is not accessible", inputs.control_port),
        )
    });

    findings.extend(inputs.connectivity.findings());

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed_ok() -> RoutedResult {
        RoutedResult {
            success: true,
            is_confirmed_routed: true,
            observed_address: Some("5.6.7.8".into()),
            latency_ms: Some(800),
            error: None,
        }
    }

    fn healthy_inputs() -> StatusInputs {
        StatusInputs {
            lifecycle: Lifecycle::Running,
            pid: Some(100),
            socks_port: 9050,
            control_port: 9051,
            socks_reachable: true,
            control_reachable: true,
            connectivity: Connectivity::Tested {
                routed: routed_ok(),
                leak: LeakResult::compare(Some("5.6.7.8".into()), Some("1.2.3.4".into())),
            },
            circuit_count: Some(3),
            geolocation: None,
        }
    }

    #[test]
    fn test_leak_comparison() {
        let leak = LeakResult::compare(Some("1.2.3.4".into()), Some("1.2.3.4".into()));
        assert!(leak.leak_detected);
        assert!(matches!(leak.ensure_clean(), Err(WardenError::LeakDetected(_))));

        let clean = LeakResult::compare(Some("1.2.3.4".into()), Some("5.6.7.8".into()));
        assert!(!clean.leak_detected);
        assert!(clean.ensure_clean().is_ok());
    }

    #[test]
    fn test_leak_comparison_normalizes_forwarded_list() {
        let leak = LeakResult::compare(Some(" 1.2.3.4".into()), Some("1.2.3.4, 10.0.0.1".into()));
        assert!(leak.leak_detected);
    }

    #[test]
    fn test_leak_missing_side_is_inconclusive() {
        let result = LeakResult::compare(Some("1.2.3.4".into()), None);
        assert!(!result.leak_detected);
        assert!(result.is_inconclusive());
        assert!(result.error.is_some());
    }

    #[test]
    fn test_all_checks_passing_is_healthy() {
        let report = StatusReport::compose(healthy_inputs());
        assert_eq!(report.overall, HealthLevel::Healthy);
        assert_eq!(report.overall.exit_code(), 0);
    }

    #[test]
    fn test_control_port_down_alone_degrades() {
        let mut inputs = healthy_inputs();
        inputs.control_reachable = false;
        let report = StatusReport::compose(inputs);
        assert_eq!(report.overall, HealthLevel::Degraded);
        assert_eq!(report.overall.exit_code(), 1);
    }

    #[test]
    fn test_process_not_running_is_always_unhealthy() {
        let mut inputs = healthy_inputs();
        inputs.lifecycle = Lifecycle::Stopped;
        assert_eq!(StatusReport::compose(inputs).overall, HealthLevel::Unhealthy);
    }

    #[test]
    fn test_unconfirmed_routing_degrades() {
        let mut inputs = healthy_inputs();
        let mut routed = routed_ok();
        routed.is_confirmed_routed = false;
        inputs.connectivity = Connectivity::Tested {
            routed,
            leak: LeakResult::compare(Some("5.6.7.8".into()), Some("1.2.3.4".into())),
        };
        assert_eq!(StatusReport::compose(inputs).overall, HealthLevel::Degraded);
    }

    #[test]
    fn test_leak_overrides_everything_else() {
        let mut inputs = healthy_inputs();
        inputs.connectivity = Connectivity::Tested {
            routed: routed_ok(),
            leak: LeakResult::compare(Some("1.2.3.4".into()), Some("1.2.3.4".into())),
        };
        let report = StatusReport::compose(inputs);
        assert_eq!(report.overall, HealthLevel::Unhealthy);
        assert!(report.leak_detected());
    }

    #[test]
    fn test_socks_down_reports_not_attempted() {
        let mut inputs = healthy_inputs();
        inputs.socks_reachable = false;
        inputs.connectivity = Connectivity::NotAttempted {
            reason: "SOCKS port unreachable".into(),
        };
        let report = StatusReport::compose(inputs);
        assert_eq!(report.overall, HealthLevel::Unhealthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["connectivity"]["outcome"], "not_attempted");
        assert_eq!(json["overall"], "unhealthy");
    }

    #[test]
    fn test_failed_connectivity_is_unhealthy() {
        let mut inputs = healthy_inputs();
        inputs.connectivity = Connectivity::Tested {
            routed: RoutedResult::failed("timed out"),
            leak: LeakResult::compare(None, Some("1.2.3.4".into())),
        };
        assert_eq!(StatusReport::compose(inputs).overall, HealthLevel::Unhealthy);
    }

    #[test]
    fn test_connectivity_health_alone() {
        let not_attempted = Connectivity::NotAttempted {
            reason: "SOCKS port unreachable".into(),
        };
        assert_eq!(not_attempted.health(), HealthLevel::Degraded);

        let clean = Connectivity::Tested {
            routed: routed_ok(),
            leak: LeakResult::compare(Some("5.6.7.8".into()), Some("1.2.3.4".into())),
        };
        assert_eq!(clean.health(), HealthLevel::Healthy);
        assert_eq!(clean.findings().len(), 2);
    }
}
