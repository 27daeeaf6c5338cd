//! HTTP clients for probes
//!
//! One client routes through the Tor SOCKS5h proxy (DNS resolved by Tor),
//! the other deliberately bypasses every proxy for direct-path comparison.

use reqwest::{Client, Proxy};
use std::time::Duration;

use warden_core::{Result, WardenError};

/// User agents for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:137.0) Gecko/20100101 Firefox/137.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
];

/// Get a random user agent
pub fn random_user_agent() -> &'static str {
    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Create a client whose every request goes through the SOCKS proxy.
///
/// Connections are never pooled: NEWNYM only moves new streams to fresh
/// circuits, so a kept-alive connection would still leave through the old exit.
pub fn create_tor_client(socks_url: &str, timeout: Duration) -> Result<Client> {
    let proxy = Proxy::all(socks_url)
        .map_err(|e| WardenError::Configuration(format!("invalid proxy {}: {}", socks_url, e)))?;

    Client::builder()
        .proxy(proxy)
        .pool_max_idle_per_host(0)
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(random_user_agent())
        .build()
        .map_err(|e| WardenError::Transport(format!("failed to build Tor client: {}", e)))
}

/// Create a client that ignores system proxy settings
pub fn create_direct_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .no_proxy()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(random_user_agent())
        .build()
        .map_err(|e| WardenError::Transport(format!("failed to build direct client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_user_agent() {
        let ua = random_user_agent();
        assert!(ua.contains("Mozilla"));
    }

    #[test]
    fn test_create_clients() {
        assert!(create_tor_client("socks5h://127.0.0.1:9050", Duration::from_secs(5)).is_ok());
        assert!(create_direct_client(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_invalid_proxy_url() {
        let err = create_tor_client("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, WardenError::Configuration(_)));
    }
}
