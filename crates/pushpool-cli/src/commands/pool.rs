use pushpool_core::PushpoolConfig;

use super::{gateway_key, open_registry};

pub async fn stats(config: &PushpoolConfig, cert: &str) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let key = gateway_key(config, cert)?;
    let stats = registry.stats(&key).await?;
    println!("Pool {key}");
    println!("  available: {}", stats.available);
    println!("  leased:    {}", stats.leased);
    println!("  total:     {} / {}", stats.total, registry.settings().max_size);
    Ok(())
}

pub async fn sweep(config: &PushpoolConfig, cert: &str) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let key = gateway_key(config, cert)?;
    let removed = registry.sweep_expired(&key, registry.settings().idle_timeout).await;
    println!("✓ Swept {removed} idle record(s) from {key}");
    Ok(())
}

pub async fn purge(config: &PushpoolConfig, cert: &str) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let key = gateway_key(config, cert)?;
    if registry.purge(&key).await? {
        println!("✓ Purged pool {key}");
    } else {
        println!("No pool recorded for {key}");
    }
    Ok(())
}
