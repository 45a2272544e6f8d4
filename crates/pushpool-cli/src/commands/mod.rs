pub mod pool;
pub mod send;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use pushpool_core::{ConnectionKey, PushpoolConfig, StoreBackend};
use pushpool_pool::{PemCredentialProvider, PoolManager, Registry, TlsSettings, TlsTransport};
use pushpool_state::{MemoryStore, RedbStore, SharedStore};
use tracing::{debug, info, warn};

/// Read `path`, or fall back to defaults when it does not exist.
pub fn load_config(path: &Path) -> anyhow::Result<PushpoolConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(PushpoolConfig::default());
    }
    PushpoolConfig::from_file(path)
}

pub fn open_store(config: &PushpoolConfig) -> anyhow::Result<Arc<dyn SharedStore>> {
    match config.store_backend()? {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redb(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = RedbStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
            info!(path = %path.display(), "redb store opened");
            Ok(Arc::new(store))
        }
    }
}

pub fn open_registry(config: &PushpoolConfig) -> anyhow::Result<Registry> {
    Ok(Registry::new(open_store(config)?, config.pool_settings()?))
}

/// Sending still works when the shared store cannot be opened; connections
/// are then pooled within this process only.
pub fn build_manager(config: &PushpoolConfig) -> anyhow::Result<PoolManager> {
    let store = open_store(config).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "shared store unavailable, pooling in this process only");
        Arc::new(MemoryStore::new())
    });
    let registry = Registry::new(store, config.pool_settings()?);
    let gateway = config.gateway_settings()?;
    let tls = TlsSettings::from_gateway(&gateway, config.ca_file());
    let credentials = Arc::new(PemCredentialProvider::new(config.credentials_dir()));
    let transport = TlsTransport::new(tls, credentials).context("initialising TLS transport")?;
    Ok(PoolManager::new(registry, Arc::new(transport)))
}

pub fn gateway_key(config: &PushpoolConfig, cert: &str) -> anyhow::Result<ConnectionKey> {
    let gateway = config.gateway_settings()?;
    Ok(ConnectionKey::new(&gateway.host, gateway.port, cert))
}

pub fn show_config(config: &PushpoolConfig) -> anyhow::Result<()> {
    let pool = config.pool_settings()?;
    let gateway = config.gateway_settings()?;
    println!("[pool]");
    println!("  max_size         = {}", pool.max_size);
    println!("  idle_timeout     = {:?}", pool.idle_timeout);
    println!("  lease_ttl        = {:?}", pool.lease_ttl);
    println!("  checkout_timeout = {:?}", pool.checkout_timeout);
    println!("  store_timeout    = {:?}", pool.store_timeout);
    println!("  cas_retries      = {}", pool.cas_retries);
    println!("  instance_id      = {}", pool.instance_id);
    println!("[store]");
    match config.store_backend()? {
        StoreBackend::Memory => println!("  backend          = memory"),
        StoreBackend::Redb(path) => println!("  backend          = redb ({})", path.display()),
    }
    println!("[gateway]");
    println!("  endpoint         = {}:{}", gateway.host, gateway.port);
    println!("  connect_timeout  = {:?}", gateway.connect_timeout);
    println!("  handshake_timeout= {:?}", gateway.handshake_timeout);
    println!("  liveness_timeout = {:?}", gateway.liveness_timeout);
    println!("  response_timeout = {:?}", gateway.response_timeout);
    println!("[credentials]");
    println!("  directory        = {}", config.credentials_dir().display());
    match config.ca_file() {
        Some(ca) => println!("  ca_file          = {}", ca.display()),
        None => println!("  ca_file          = (system store)"),
    }
    Ok(())
}
