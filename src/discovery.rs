//! Join seed discovery

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tokio::net::lookup_host;
use tracing::info;

/// Resolve `host` and return every address as a seed on `port`, followed by
/// the explicit `extra` seeds. Duplicates are dropped and order is kept.
///
/// Every address shares the local cluster port; per-seed ports can only be
/// given through `extra`. An empty `host` skips the lookup. A failed lookup
/// is returned so the caller can retry it.
pub async fn discover_seeds(host: &str, port: u16, extra: &[String]) -> Result<Vec<String>> {
    let mut seeds = Vec::new();

    if !host.is_empty() {
        let addrs = lookup_host((host, port))
            .await
            .with_context(|| format!("Seed lookup for {host} failed"))?;
        for addr in addrs {
            info!(discovery_host = %host, seed = %addr, "Discovered seed");
            seeds.push(addr.to_string());
        }
    }

    seeds.extend(extra.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
    Ok(dedupe(seeds))
}

fn dedupe(seeds: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    seeds
        .into_iter()
        .filter(|seed| seen.insert(seed.clone()))
        .collect()
}
