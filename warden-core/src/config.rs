//! Configuration loading and validation
//!
//! A single TOML file with `[proxy]`, `[supervisor]` and `[probe]` tables.
//! Every field has a default except the control secret. The proxy section is
//! immutable once the daemon starts; changing it means a restart.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, WardenError, DEFAULT_CONTROL_PORT, DEFAULT_SOCKS_PORT};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub proxy: ProxyConfiguration,
    pub supervisor: SupervisorSettings,
    pub probe: ProbeSettings,
}

/// Daemon startup configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfiguration {
    /// SOCKS listener (default: 9050)
    pub socks_port: u16,
    /// Control port listener (default: 9051)
    pub control_port: u16,
    /// Plaintext control secret; hashed before it reaches the daemon
    #[serde(skip_serializing)]
    pub control_secret: String,
    /// Allowed exit countries as ISO 3166 alpha-2 codes
    pub exit_countries: Vec<String>,
    /// Only ever use the listed exits
    pub strict_nodes: bool,
    /// Seconds between new circuit considerations
    pub new_circuit_period_secs: u64,
    /// Seconds a used circuit may keep taking new streams
    pub max_circuit_dirtiness_secs: u64,
    /// Never pick two relays from the same /16
    pub enforce_distinct_subnets: bool,
    /// Use long-lived entry guards
    pub use_entry_guards: bool,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            socks_port: DEFAULT_SOCKS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            control_secret: String::new(),
            exit_countries: ["us", "de", "nl", "se", "ch"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            strict_nodes: true,
            new_circuit_period_secs: 30,
            max_circuit_dirtiness_secs: 600,
            enforce_distinct_subnets: true,
            use_entry_guards: true,
        }
    }
}

// Hand-written so the secret never ends up in logs
impl fmt::Debug for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfiguration")
            .field("socks_port", &self.socks_port)
            .field("control_port", &self.control_port)
            .field("control_secret", &"<redacted>")
            .field("exit_countries", &self.exit_countries)
            .field("strict_nodes", &self.strict_nodes)
            .field("new_circuit_period_secs", &self.new_circuit_period_secs)
            .field("max_circuit_dirtiness_secs", &self.max_circuit_dirtiness_secs)
            .field("enforce_distinct_subnets", &self.enforce_distinct_subnets)
            .field("use_entry_guards", &self.use_entry_guards)
            .finish()
    }
}

impl ProxyConfiguration {
    /// Reject configurations the daemon would refuse or silently misinterpret
    pub fn validate(&self) -> Result<()> {
        self.validate_endpoints()?;
        self.require_secret()
    }

    /// Control secret present and passable on the daemon command line.
    /// Only launching and authenticating need it.
    pub fn require_secret(&self) -> Result<()> {
        if self.control_secret.trim().is_empty() {
            return Err(WardenError::Configuration(
                "control secret is required (set WARDEN_CONTROL_SECRET or proxy.control_secret)"
                    .into(),
            ));
        }
        if self
            .control_secret
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(WardenError::Configuration(
                "control secret must not contain whitespace or control characters".into(),
            ));
        }
        Ok(())
    }

    /// Everything except the secret: enough to probe ports and connectivity
    pub fn validate_endpoints(&self) -> Result<()> {
        if self.socks_port == 0 || self.control_port == 0 {
            return Err(WardenError::Configuration("ports must be non-zero".into()));
        }
        if self.socks_port == self.control_port {
            return Err(WardenError::Configuration(format!(
                "socks and control port are both {}",
                self.socks_port
            )));
        }
        for code in &self.exit_countries {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(WardenError::Configuration(format!(
                    "invalid exit country code: {:?}",
                    code
                )));
            }
        }
        if self.new_circuit_period_secs == 0 || self.max_circuit_dirtiness_secs == 0 {
            return Err(WardenError::Configuration(
                "circuit lifetime bounds must be positive".into(),
            ));
        }
        if self.new_circuit_period_secs > self.max_circuit_dirtiness_secs {
            return Err(WardenError::Configuration(format!(
                "new circuit period ({}s) exceeds max circuit dirtiness ({}s)",
                self.new_circuit_period_secs, self.max_circuit_dirtiness_secs
            )));
        }
        Ok(())
    }

    /// Daemon startup options, in the order they are passed on the command line.
    /// The hashed secret is supplied by the caller; the plaintext never leaves this struct.
    pub fn launch_options(&self, hashed_secret: &str) -> Vec<(&'static str, String)> {
        let mut options = vec![
            ("SocksPort", self.socks_port.to_string()),
            ("ControlPort", self.control_port.to_string()),
            ("HashedControlPassword", hashed_secret.to_string()),
        ];

        if !self.exit_countries.is_empty() {
            let exits = self
                .exit_countries
                .iter()
                .map(|c| format!("{{{}}}", c.to_ascii_lowercase()))
                .collect::<Vec<_>>()
                .join(",");
            options.push(("ExitNodes", exits));
        }

        options.extend([
            ("StrictNodes", flag(self.strict_nodes)),
            ("NewCircuitPeriod", self.new_circuit_period_secs.to_string()),
            ("MaxCircuitDirtiness", self.max_circuit_dirtiness_secs.to_string()),
            ("EnforceDistinctSubnets", flag(self.enforce_distinct_subnets)),
            ("UseEntryGuards", flag(self.use_entry_guards)),
        ]);
        options
    }

    /// `socks5h://` URL for HTTP clients; the `h` keeps DNS inside Tor
    pub fn socks_url(&self) -> String {
        format!("socks5h://{}:{}", crate::LOCALHOST, self.socks_port)
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// How the daemon process is launched and torn down
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Daemon binary; looked up on PATH when unset
    pub tor_binary: Option<PathBuf>,
    /// Data directory; a private temporary directory when unset
    pub data_dir: Option<PathBuf>,
    /// Maximum wait for "Bootstrapped 100%"
    pub bootstrap_timeout_secs: u64,
    /// Wait between graceful termination and force-kill
    pub grace_secs: u64,
    /// Control handshake and per-command timeout
    pub control_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tor_binary: None,
            data_dir: None,
            bootstrap_timeout_secs: 120,
            grace_secs: 2,
            control_timeout_secs: 10,
        }
    }
}

impl SupervisorSettings {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

/// Outbound probe endpoints and timeouts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Returns `{"origin": "<address>"}`
    pub echo_url: String,
    /// Returns `{"IsTor": bool, "IP": "<address>"}`
    pub tor_check_url: String,
    /// `{ip}` is replaced with the address to look up
    pub geolocation_url: String,
    /// Look up exit geolocation in status reports
    pub geolocation: bool,
    /// Per-request HTTP timeout in seconds
    pub http_timeout_secs: u64,
    /// TCP connect timeout for port reachability, in milliseconds
    pub port_timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            echo_url: "https://httpbin.org/ip".to_string(),
            tor_check_url: "https://check.torproject.org/api/ip".to_string(),
            geolocation_url: "http://ip-api.com/json/{ip}".to_string(),
            geolocation: true,
            http_timeout_secs: 10,
            port_timeout_ms: 2000,
        }
    }
}

impl ProbeSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }
}

/// Load configuration from a TOML file
pub fn load_from_path(path: &Path) -> Result<WardenConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        WardenError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<WardenConfig> {
    toml::from_str(content).map_err(|e| WardenError::Configuration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProxyConfiguration {
        ProxyConfiguration {
            control_secret: "s3cret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfiguration::default();
        assert_eq!(config.socks_port, 9050);
        assert_eq!(config.control_port, 9051);
        assert_eq!(config.exit_countries.len(), 5);
        assert!(config.control_secret.is_empty());
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        let err = ProxyConfiguration::default().validate().unwrap_err();
        assert!(matches!(err, WardenError::Configuration(_)));
    }

    #[test]
    fn test_endpoints_valid_without_secret() {
        let config = ProxyConfiguration::default();
        assert!(config.validate_endpoints().is_ok());
        assert!(config.require_secret().is_err());

        let mut same_ports = ProxyConfiguration::default();
        same_ports.control_port = same_ports.socks_port;
        assert!(same_ports.validate_endpoints().is_err());
    }

    #[test]
    fn test_validation_rules() {
        assert!(valid().validate().is_ok());

        let mut same_ports = valid();
        same_ports.control_port = same_ports.socks_port;
        assert!(same_ports.validate().is_err());

        let mut zero = valid();
        zero.socks_port = 0;
        assert!(zero.validate().is_err());

        let mut bad_country = valid();
        bad_country.exit_countries = vec!["usa".into()];
        assert!(bad_country.validate().is_err());

        let mut inverted = valid();
        inverted.new_circuit_period_secs = 900;
        assert!(inverted.validate().is_err());

        let mut spaced = valid();
        spaced.control_secret = "two words".into();
        assert!(spaced.validate().is_err());
    }

    #[test]
    fn test_launch_options() {
        let options = valid().launch_options("16:ABCDEF");
        let get = |key: &str| {
            options
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("SocksPort").as_deref(), Some("9050"));
        assert_eq!(get("HashedControlPassword").as_deref(), Some("16:ABCDEF"));
        assert_eq!(get("ExitNodes").as_deref(), Some("{us},{de},{nl},{se},{ch}"));
        assert_eq!(get("StrictNodes").as_deref(), Some("1"));
        assert_eq!(get("MaxCircuitDirtiness").as_deref(), Some("600"));
        assert!(options.iter().all(|(_, v)| !v.contains("s3cret")));
    }

    #[test]
    fn test_empty_exit_list_omits_exit_nodes() {
        let mut config = valid();
        config.exit_countries.clear();
        let options = config.launch_options("16:00");
        assert!(options.iter().all(|(k, _)| *k != "ExitNodes"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = parse(
            r#"
            [proxy]
            socks_port = 19050
            control_secret = "abc"
            exit_countries = ["is"]

            [supervisor]
            grace_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.socks_port, 19050);
        assert_eq!(config.proxy.control_port, 9051);
        assert_eq!(config.proxy.exit_countries, vec!["is".to_string()]);
        assert_eq!(config.supervisor.grace(), Duration::from_secs(5));
        assert_eq!(config.supervisor.bootstrap_timeout_secs, 120);
        assert_eq!(config.probe.echo_url, "https://httpbin.org/ip");
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[probe]\ngeolocation = false\n").unwrap();

        let config = load_from_path(&path).unwrap();
        assert!(!config.probe.geolocation);

        let missing = load_from_path(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(WardenError::Configuration(_))));
    }

    #[test]
    fn test_socks_url() {
        assert_eq!(valid().socks_url(), "socks5h://127.0.0.1:9050");
    }
}
