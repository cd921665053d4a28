//! Load dispatch defaults from file and environment.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lumen_core::{retry, RetryGaps, Target, TargetError, DEFAULT_PORT};
use tracing::warn;

/// Engine configuration. File: ~/.config/lumen/config.toml or /etc/lumen/config.toml.
/// Env overrides: LUMEN_DEFAULT_BROADCAST, SERIAL_FILTER, HARDCODED_DISCOVERY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where broadcasts go when no address is given (default 255.255.255.255:56700).
    #[serde(default = "default_broadcast")]
    pub default_broadcast: SocketAddr,
    #[serde(default = "default_find_timeout")]
    pub find_timeout_secs: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: f64,
    /// Max in-flight messages per call; 0 means unlimited.
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub discovery: DiscoveryOptions,
}

fn default_broadcast() -> SocketAddr {
    SocketAddr::from(([255, 255, 255, 255], DEFAULT_PORT))
}
fn default_find_timeout() -> f64 {
    20.0
}
fn default_connect_timeout() -> f64 {
    10.0
}
fn default_message_timeout() -> f64 {
    10.0
}
fn default_limit() -> usize {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_broadcast: default_broadcast(),
            find_timeout_secs: default_find_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            message_timeout_secs: default_message_timeout(),
            limit: default_limit(),
            retry: RetryConfig::default(),
            discovery: DiscoveryOptions::default(),
        }
    }
}

impl Config {
    pub fn find_timeout(&self) -> Duration {
        secs(self.find_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        secs(self.message_timeout_secs)
    }

    pub fn gaps(&self) -> RetryGaps {
        self.retry.gaps()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_millis((s * 1000.0).round().max(0.0) as u64)
}

/// Retry gaps in seconds. `timeouts` is a list of `[step, end]` pairs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub gap_between_results: f64,
    pub gap_between_ack_and_res: f64,
    pub timeouts: Vec<(f64, f64)>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let gaps = RetryGaps::default();
        Self {
            gap_between_results: gaps.gap_between_results.as_secs_f64(),
            gap_between_ack_and_res: gaps.gap_between_ack_and_res.as_secs_f64(),
            timeouts: gaps
                .timeouts
                .iter()
                .map(|(s, e)| (s.as_secs_f64(), e.as_secs_f64()))
                .collect(),
        }
    }
}

impl RetryConfig {
    pub fn gaps(&self) -> RetryGaps {
        RetryGaps {
            gap_between_results: secs(self.gap_between_results),
            gap_between_ack_and_res: secs(self.gap_between_ack_and_res),
            timeouts: retry::secs(&self.timeouts),
        }
    }
}

/// Restricts which devices discovery reports, or replaces broadcast
/// discovery with a fixed serial → address table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawDiscovery")]
pub struct DiscoveryOptions {
    pub serial_filter: Option<Vec<Target>>,
    pub hardcoded: HashMap<Target, SocketAddr>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawDiscovery {
    serial_filter: Option<Vec<String>>,
    hardcoded: HashMap<String, String>,
}

impl TryFrom<RawDiscovery> for DiscoveryOptions {
    type Error = ConfigError;

    fn try_from(raw: RawDiscovery) -> Result<Self, Self::Error> {
        let serial_filter = raw
            .serial_filter
            .map(|list| {
                list.iter()
                    .map(|s| Target::parse(s))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        Ok(Self {
            serial_filter,
            hardcoded: parse_hardcoded(&raw.hardcoded)?,
        })
    }
}

impl DiscoveryOptions {
    /// Whether discovery may report this device.
    pub fn want(&self, target: &Target) -> bool {
        match &self.serial_filter {
            Some(filter) if !filter.is_empty() => filter.contains(target),
            _ => true,
        }
    }

    pub fn has_hardcoded_discovery(&self) -> bool {
        !self.hardcoded.is_empty()
    }
}

fn parse_hardcoded(
    raw: &HashMap<String, String>,
) -> Result<HashMap<Target, SocketAddr>, ConfigError> {
    raw.iter()
        .map(|(serial, host)| Ok((Target::parse(serial)?, parse_host(host)?)))
        .collect()
}

/// `host` or `host:port`; the port defaults to the device port.
fn parse_host(host: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    host.parse::<std::net::IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
        .map_err(|_| ConfigError::InvalidAddress(host.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid serial: {0}")]
    Serial(#[from] TargetError),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LUMEN_DEFAULT_BROADCAST") {
        match parse_host(&s) {
            Ok(addr) => c.default_broadcast = addr,
            Err(e) => warn!(error = %e, "ignoring LUMEN_DEFAULT_BROADCAST"),
        }
    }
    if let Some(s) = var("SERIAL_FILTER") {
        if s == "null" {
            c.discovery.serial_filter = None;
        } else {
            match lumen_core::parse_serials(&s) {
                Ok(list) => c.discovery.serial_filter = Some(list),
                Err(e) => warn!(error = %e, "ignoring SERIAL_FILTER"),
            }
        }
    }
    if let Some(s) = var("HARDCODED_DISCOVERY") {
        let parsed = serde_json::from_str::<HashMap<String, String>>(&s)
            .map_err(ConfigError::from)
            .and_then(|raw| parse_hardcoded(&raw));
        match parsed {
            Ok(table) => c.discovery.hardcoded = table,
            Err(e) => warn!(error = %e, "ignoring HARDCODED_DISCOVERY"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lumen/config.toml"));
    }
    out.push(PathBuf::from("/etc/lumen/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match Config::from_toml_str(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "ignoring config file"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "failed to read config file"),
            }
            break;
        }
    }
    None
}
