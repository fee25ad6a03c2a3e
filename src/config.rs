//! Relay configuration file support
//!
//! Settings can come from a YAML file passed with `--config`:
//!
//! ```yaml
//! requester:
//!   peer: tuners.example.net
//!   pending_timeout_ms: 5000
//! responder:
//!   bind_host: 0.0.0.0
//!   target: 192.168.1.255
//! ```
//!
//! Command-line flags take precedence over the file; the file takes
//! precedence over built-in defaults.

use anyhow::{bail, Context, Result};
use hdhr_relay_connection::{with_default_port, ReconnectConfig};
use hdhr_relay_proto::{DEFAULT_TUNNEL_PORT, HDHOMERUN_DISCOVER_UDP_PORT};
use hdhr_relay_requester::RequesterConfig;
use hdhr_relay_responder::ResponderConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfigFile {
    #[serde(default)]
    pub requester: RequesterSettings,

    #[serde(default)]
    pub responder: ResponderSettings,
}

impl RelayConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

/// Requester settings; unset fields fall back to defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequesterSettings {
    /// Responder-side relay host, optionally with a port
    pub peer: Option<String>,
    pub discovery_bind: Option<SocketAddr>,
    /// Port used when `peer` has none
    pub tunnel_port: Option<u16>,
    pub pending_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
}

impl RequesterSettings {
    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: Self) -> Self {
        Self {
            peer: self.peer.or(fallback.peer),
            discovery_bind: self.discovery_bind.or(fallback.discovery_bind),
            tunnel_port: self.tunnel_port.or(fallback.tunnel_port),
            pending_timeout_ms: self.pending_timeout_ms.or(fallback.pending_timeout_ms),
            sweep_interval_ms: self.sweep_interval_ms.or(fallback.sweep_interval_ms),
            reconnect_initial_ms: self.reconnect_initial_ms.or(fallback.reconnect_initial_ms),
            reconnect_max_ms: self.reconnect_max_ms.or(fallback.reconnect_max_ms),
        }
    }

    pub fn into_config(self) -> Result<RequesterConfig> {
        let Some(peer) = self.peer.filter(|peer| !peer.is_empty()) else {
            bail!("No peer relay given (pass PEER or set requester.peer in the config file)");
        };

        let defaults = RequesterConfig::default();
        let reconnect_defaults = ReconnectConfig::default();

        let reconnect = ReconnectConfig {
            initial_backoff: millis_or(self.reconnect_initial_ms, reconnect_defaults.initial_backoff),
            max_backoff: millis_or(self.reconnect_max_ms, reconnect_defaults.max_backoff),
            ..reconnect_defaults
        };
        if reconnect.initial_backoff > reconnect.max_backoff {
            bail!("reconnect_initial_ms must not exceed reconnect_max_ms");
        }

        let config = RequesterConfig {
            peer: with_default_port(&peer, self.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT)),
            discovery_addr: self.discovery_bind.unwrap_or(defaults.discovery_addr),
            pending_timeout: millis_or(self.pending_timeout_ms, defaults.pending_timeout),
            sweep_interval: millis_or(self.sweep_interval_ms, defaults.sweep_interval),
            reconnect,
        };

        if config.pending_timeout.is_zero() || config.sweep_interval.is_zero() {
            bail!("pending_timeout_ms and sweep_interval_ms must be greater than zero");
        }

        Ok(config)
    }
}

/// Responder settings; unset fields fall back to defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponderSettings {
    /// Host or address the tunnel listener binds to
    pub bind_host: Option<String>,
    pub tunnel_port: Option<u16>,
    /// Broadcast or device address, with an optional port
    pub target: Option<String>,
    pub response_window_ms: Option<u64>,
}

impl ResponderSettings {
    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: Self) -> Self {
        Self {
            bind_host: self.bind_host.or(fallback.bind_host),
            tunnel_port: self.tunnel_port.or(fallback.tunnel_port),
            target: self.target.or(fallback.target),
            response_window_ms: self.response_window_ms.or(fallback.response_window_ms),
        }
    }

    pub async fn into_config(self) -> Result<ResponderConfig> {
        let defaults = ResponderConfig::default();
        let port = self.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT);

        let bind_addr = match self.bind_host.as_deref() {
            None => SocketAddr::new(defaults.bind_addr.ip(), port),
            Some(host) => resolve_host(host, port).await?,
        };

        let target_addr = match self.target.as_deref() {
            None => defaults.target_addr,
            Some(target) => parse_target(target)?,
        };

        let response_window = millis_or(self.response_window_ms, defaults.response_window);
        if response_window.is_zero() {
            bail!("response_window_ms must be greater than zero");
        }

        Ok(ResponderConfig {
            bind_addr,
            target_addr,
            response_window,
        })
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve bind host: {}", host))?
        .next()
        .with_context(|| format!("Bind host has no addresses: {}", host))
}

/// Parse `ip` or `ip:port`; the port defaults to the discovery port
pub fn parse_target(target: &str) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, HDHOMERUN_DISCOVER_UDP_PORT));
    }
    bail!("Invalid target address: {}", target)
}

/// Default discovery bind address, for help text
pub fn default_discovery_bind() -> SocketAddr {
    (Ipv4Addr::UNSPECIFIED, HDHOMERUN_DISCOVER_UDP_PORT).into()
}
