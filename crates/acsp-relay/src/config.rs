// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.
//!
//! Loaded from a TOML file (or JSON, by extension) and then overridden by
//! command line arguments.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Relay not configured: {0}")]
    Unconfigured(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid plugin '{spec}' (expected name:host:remote_port:local_port): {reason}")]
    PluginSpec { spec: String, reason: String },

    #[error("Cannot resolve {0}")]
    Resolve(String),
}

/// What sits upstream of this relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// The simulation server, over UDP.
    #[default]
    Direct,
    /// Another relay, over TCP.
    Chained,
}

/// Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Statistics log interval in seconds (0 = disabled).
    #[serde(default)]
    pub stats_interval_secs: u64,

    /// Upstream connection.
    #[serde(default)]
    pub server: ServerConfig,

    /// Downstream relay listener.
    #[serde(default)]
    pub relay: ChainConfig,

    /// UDP plugins.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// Upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub mode: UpstreamMode,

    /// Server (direct) or upstream relay (chained) host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Server plugin port (direct) or upstream relay TCP port (chained).
    #[serde(default)]
    pub server_port: u16,

    /// Local UDP port the server sends plugin events to (direct mode).
    #[serde(default)]
    pub local_port: u16,

    /// Connect timeout for chained mode, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Listener for downstream relays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    /// TCP port to accept downstream relays on (0 = disabled).
    #[serde(default)]
    pub listen_port: u16,
}

/// One UDP plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    /// Port the plugin listens on.
    pub remote_port: u16,

    /// Port the relay listens on for this plugin.
    pub local_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::Direct,
            host: default_host(),
            server_port: 0,
            local_port: 0,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    /// Example configuration used by `gen-config`.
    pub fn example() -> Self {
        Self {
            stats_interval_secs: 60,
            server: ServerConfig {
                mode: UpstreamMode::Direct,
                host: default_host(),
                server_port: 12000,
                local_port: 12001,
                connect_timeout_secs: default_connect_timeout(),
            },
            relay: ChainConfig { listen_port: 12100 },
            plugins: vec![
                PluginConfig::new("timing", "127.0.0.1", 11000, 11001),
                PluginConfig::new("stracker", "127.0.0.1", 11010, 11011),
            ],
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.server_port == 0 {
            return Err(ConfigError::Unconfigured(
                "server.server_port is not set".into(),
            ));
        }
        if self.server.mode == UpstreamMode::Direct && self.server.local_port == 0 {
            return Err(ConfigError::Unconfigured(
                "server.local_port is not set".into(),
            ));
        }
        if self.server.mode == UpstreamMode::Chained && self.server.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.connect_timeout_secs cannot be 0".into(),
            ));
        }

        let mut local_ports = HashSet::new();
        if self.server.mode == UpstreamMode::Direct {
            local_ports.insert(self.server.local_port);
        }

        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(ConfigError::Invalid("plugin with empty name".into()));
            }
            if plugin.remote_port == 0 || plugin.local_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "plugin '{}' needs both remote_port and local_port",
                    plugin.name
                )));
            }
            if !local_ports.insert(plugin.local_port) {
                return Err(ConfigError::Invalid(format!(
                    "plugin '{}' reuses local UDP port {}",
                    plugin.name, plugin.local_port
                )));
            }
        }

        Ok(())
    }

    /// Upstream address (server or upstream relay).
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.server.host, self.server.server_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn add_plugin(&mut self, plugin: PluginConfig) {
        self.plugins.push(plugin);
    }
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            remote_port,
            local_port,
        }
    }

    /// Address the plugin listens on.
    pub fn remote_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(&self.host, self.remote_port)
    }
}

impl FromStr for PluginConfig {
    type Err = ConfigError;

    /// Parse `name:host:remote_port:local_port`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::PluginSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let [name, host, remote, local] = parts.as_slice() else {
            return Err(invalid("expected 4 fields"));
        };
        if name.is_empty() || host.is_empty() {
            return Err(invalid("empty name or host"));
        }
        let remote_port = remote.parse().map_err(|_| invalid("bad remote port"))?;
        let local_port = local.parse().map_err(|_| invalid("bad local port"))?;

        Ok(Self::new(*name, *host, remote_port, local_port))
    }
}

/// Resolve `host:port`, preferring IPv4 like the server does.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Resolve(format!("{}:{} ({})", host, port, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ConfigError::Resolve(format!("{}:{}", host, port)))
}
