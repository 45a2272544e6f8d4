//! pushpool.toml configuration parser.
//!
//! The file mirrors the runtime settings one section per concern. Every
//! field is optional; [`PushpoolConfig::pool_settings`] and friends resolve
//! the raw strings into typed settings with defaults applied.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushpoolConfig {
    pub pool: Option<PoolSection>,
    pub store: Option<StoreSection>,
    pub gateway: Option<GatewaySection>,
    pub credentials: Option<CredentialsSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSection {
    pub max_size: Option<usize>,
    pub idle_timeout: Option<String>,
    pub lease_ttl: Option<String>,
    pub checkout_timeout: Option<String>,
    pub store_timeout: Option<String>,
    pub cas_retries: Option<u32>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    pub backend: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout: Option<String>,
    pub handshake_timeout: Option<String>,
    pub liveness_timeout: Option<String>,
    pub response_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsSection {
    pub directory: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

/// Resolved pool settings.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    /// Maximum records (available + leased) per connection key (default: 10).
    pub max_size: usize,
    /// Available records idle longer than this are swept (default: 120s,
    /// how long the gateway keeps an inactive socket open).
    pub idle_timeout: Duration,
    /// Lifetime of a checkout lease before the record is considered free again (default: 60s).
    pub lease_ttl: Duration,
    /// Default bound for a whole `with_connection` call (default: 5s).
    pub checkout_timeout: Duration,
    /// Bound for a single shared-store round trip (default: 500ms).
    pub store_timeout: Duration,
    /// Compare-and-set attempts before a registry mutation gives up (default: 8).
    pub cas_retries: u32,
    /// Lease owner recorded in the registry for diagnostics.
    pub instance_id: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(60),
            checkout_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_millis(500),
            cas_retries: 8,
            instance_id: default_instance_id(),
        }
    }
}

/// Resolved gateway endpoint and transport timeouts.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a resumed connection is watched for a peer close.
    pub liveness_timeout: Duration,
    /// How long to wait for an error frame after writing a batch.
    pub response_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "gateway.push.apple.com".to_string(),
            port: 2195,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_millis(5),
            response_timeout: Duration::from_millis(250),
        }
    }
}

/// Which shared store backs the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local map; pooling only spans tasks in one process.
    Memory,
    /// redb database file shared by everything opening the same path.
    Redb(PathBuf),
}

impl PushpoolConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: PushpoolConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn pool_settings(&self) -> anyhow::Result<PoolSettings> {
        let defaults = PoolSettings::default();
        let Some(section) = &self.pool else {
            return Ok(defaults);
        };
        let max_size = section.max_size.unwrap_or(defaults.max_size);
        if max_size == 0 {
            bail!("pool.max_size must be at least 1");
        }
        Ok(PoolSettings {
            max_size,
            idle_timeout: duration_or(&section.idle_timeout, defaults.idle_timeout, "pool.idle_timeout")?,
            lease_ttl: duration_or(&section.lease_ttl, defaults.lease_ttl, "pool.lease_ttl")?,
            checkout_timeout: duration_or(
                &section.checkout_timeout,
                defaults.checkout_timeout,
                "pool.checkout_timeout",
            )?,
            store_timeout: duration_or(&section.store_timeout, defaults.store_timeout, "pool.store_timeout")?,
            cas_retries: section.cas_retries.unwrap_or(defaults.cas_retries).max(1),
            instance_id: section.instance_id.clone().unwrap_or(defaults.instance_id),
        })
    }

    pub fn gateway_settings(&self) -> anyhow::Result<GatewaySettings> {
        let defaults = GatewaySettings::default();
        let Some(section) = &self.gateway else {
            return Ok(defaults);
        };
        Ok(GatewaySettings {
            host: section.host.clone().unwrap_or(defaults.host),
            port: section.port.unwrap_or(defaults.port),
            connect_timeout: duration_or(
                &section.connect_timeout,
                defaults.connect_timeout,
                "gateway.connect_timeout",
            )?,
            handshake_timeout: duration_or(
                &section.handshake_timeout,
                defaults.handshake_timeout,
                "gateway.handshake_timeout",
            )?,
            liveness_timeout: duration_or(&section.liveness_timeout, defaults.liveness_timeout, "gateway.liveness_timeout")?,
            response_timeout: duration_or(
                &section.response_timeout,
                defaults.response_timeout,
                "gateway.response_timeout",
            )?,
        })
    }

    pub fn store_backend(&self) -> anyhow::Result<StoreBackend> {
        let Some(section) = &self.store else {
            return Ok(StoreBackend::Memory);
        };
        match section.backend.as_deref().unwrap_or("memory") {
            "memory" => Ok(StoreBackend::Memory),
            "redb" => {
                let path = section
                    .path
                    .clone()
                    .context("store.path is required for the redb backend")?;
                Ok(StoreBackend::Redb(path))
            }
            other => bail!("unknown store.backend '{other}' (expected memory or redb)"),
        }
    }

    /// Directory holding one PEM file per credential identity (default: `certificates`).
    pub fn credentials_dir(&self) -> PathBuf {
        self.credentials
            .as_ref()
            .and_then(|c| c.directory.clone())
            .unwrap_or_else(|| PathBuf::from("certificates"))
    }

    pub fn ca_file(&self) -> Option<PathBuf> {
        self.credentials.as_ref().and_then(|c| c.ca_file.clone())
    }
}

fn duration_or(raw: &Option<String>, default: Duration, field: &str) -> anyhow::Result<Duration> {
    match raw {
        Some(s) => parse_duration(s).with_context(|| format!("invalid duration for {field}: '{s}'")),
        None => Ok(default),
    }
}

/// Parse a duration string like "5s", "250ms", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn default_instance_id() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => format!("{host}/{}", std::process::id()),
        _ => format!("pid-{}", std::process::id()),
    }
}
