//! Connectivity probes
//!
//! Port reachability, an anonymity check routed through the SOCKS port,
//! a routed-vs-direct leak comparison, and exit geolocation.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use warden_core::{
    GeoLocation, LeakResult, ProbeSettings, ProxyConfiguration, Result, RoutedResult, WardenError,
};

use crate::{create_direct_client, create_tor_client};

/// TCP connect within `timeout`; any failure counts as unreachable
pub async fn port_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// `{"IsTor": true, "IP": "..."}`
#[derive(Debug, Deserialize)]
struct TorCheck {
    #[serde(rename = "IsTor", default)]
    is_tor: bool,
    #[serde(rename = "IP")]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EchoReply {
    origin: String,
}

#[derive(Debug, Deserialize)]
struct GeoReply {
    status: Option<String>,
    country: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    org: Option<String>,
    timezone: Option<String>,
}

/// Address reported by an echo endpoint
pub fn parse_echo(body: &str) -> Option<String> {
    serde_json::from_str::<EchoReply>(body)
        .ok()
        .map(|reply| reply.origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
}

/// `(is_tor, address)` from the anonymity check endpoint
pub fn parse_tor_check(body: &str) -> Option<(bool, Option<String>)> {
    serde_json::from_str::<TorCheck>(body)
        .ok()
        .map(|check| (check.is_tor, check.ip))
}

/// Geolocation answer; a `"status": "fail"` reply yields nothing
pub fn parse_geolocation(body: &str) -> Option<GeoLocation> {
    let reply: GeoReply = serde_json::from_str(body).ok()?;
    if reply.status.as_deref() == Some("fail") {
        return None;
    }

    let or_unknown = |field: Option<String>| field.unwrap_or_else(|| "Unknown".to_string());
    Some(GeoLocation {
        country: or_unknown(reply.country),
        region: or_unknown(reply.region_name),
        city: or_unknown(reply.city),
        org: or_unknown(reply.org),
        timezone: or_unknown(reply.timezone),
    })
}

/// Outbound checks through the proxy and around it
pub struct ConnectivityProbe {
    tor: Client,
    direct: Client,
    settings: ProbeSettings,
}

impl ConnectivityProbe {
    pub fn new(proxy: &ProxyConfiguration, settings: ProbeSettings) -> Result<Self> {
        let timeout = settings.http_timeout();
        Ok(Self {
            tor: create_tor_client(&proxy.socks_url(), timeout)?,
            direct: create_direct_client(timeout)?,
            settings,
        })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// One request through the proxy to the anonymity check
    pub async fn test_routed(&self) -> RoutedResult {
        let started = Instant::now();
        let body = match fetch(&self.tor, &self.settings.tor_check_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Routed check failed: {}", e);
                return RoutedResult::failed(e.to_string());
            },
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match parse_tor_check(&body) {
            Some((is_tor, address)) => {
                debug!("Routed check: IsTor={} IP={:?} in {}ms", is_tor, address, latency_ms);
                RoutedResult {
                    success: true,
                    is_confirmed_routed: is_tor,
                    observed_address: address,
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            },
            None => RoutedResult::failed("unexpected anonymity check response"),
        }
    }

    /// Same echo request routed and direct, issued concurrently
    pub async fn test_leak(&self) -> LeakResult {
        let (routed, direct) = tokio::join!(self.observed_address(), self.direct_address());

        let routed = routed
            .map_err(|e| debug!("Routed echo failed: {}", e))
            .ok();
        let direct = direct
            .map_err(|e| debug!("Direct echo failed: {}", e))
            .ok();

        let result = LeakResult::compare(routed, direct);
        if result.leak_detected {
            error!(
                "LEAK DETECTED: routed traffic exits from {:?}",
                result.direct_address
            );
        }
        result
    }

    /// Exit address as seen by the echo endpoint through the proxy
    pub async fn observed_address(&self) -> Result<String> {
        self.echo(&self.tor).await
    }

    /// Address the echo endpoint sees without the proxy
    pub async fn direct_address(&self) -> Result<String> {
        self.echo(&self.direct).await
    }

    /// Best-effort lookup through the proxy; failures are logged and dropped
    pub async fn geolocate(&self, address: &str) -> Option<GeoLocation> {
        let url = self.settings.geolocation_url.replace("{ip}", address);
        match fetch(&self.tor, &url).await {
            Ok(body) => parse_geolocation(&body),
            Err(e) => {
                debug!("Geolocation for {} unavailable: {}", address, e);
                None
            },
        }
    }

    async fn echo(&self, client: &Client) -> Result<String> {
        let body = fetch(client, &self.settings.echo_url).await?;
        parse_echo(&body).ok_or_else(|| {
            WardenError::Protocol(format!("no address in response from {}", self.settings.echo_url))
        })
    }
}

async fn fetch(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| WardenError::Transport(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(WardenError::Transport(format!("{} returned {}", url, status)));
    }

    response
        .text()
        .await
        .map_err(|e| WardenError::Transport(format!("{}: {}", url, e)))
}
