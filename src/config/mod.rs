pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

/// On-disk representation of the configuration tree. Deployments ship
/// TOML; JSON exists for generated configs. Both deserialize into the
/// same structs, so the distinction ends here.
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn sniff(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            other => anyhow::bail!(
                "cannot tell how to parse {} (extension {:?}); name the file .toml or .json",
                path.display(),
                other
            ),
        }
    }
}

impl ControlConfig {
    /// Assemble the effective configuration: built-in defaults, replaced by
    /// the file at `path` when one exists, then `AETHER_*` environment
    /// overrides, then whole-tree validation. A node with no file at all
    /// boots a single-member cluster on the stock band plan.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            match ConfigFormat::sniff(path)? {
                ConfigFormat::Toml => toml::from_str(&raw)?,
                ConfigFormat::Json => serde_json::from_str(&raw)?,
            }
        } else {
            tracing::info!(
                "config: nothing at {}, starting from defaults",
                path.display()
            );
            ControlConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("config: effective configuration assembled");
        Ok(config)
    }

    /// Apply environment variable overrides for deployment-specific settings.
    /// The band plan, rate-limit rules and alert thresholds are file-managed;
    /// only addresses, endpoints and identity come from the environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AETHER_NODE_ID") {
            self.cluster.node_id = Some(v);
        }
        if let Ok(v) = std::env::var("AETHER_ADVERTISE_ADDR") {
            self.cluster.advertise_addr = v;
        }
        if let Ok(v) = std::env::var("AETHER_PEERS") {
            self.cluster.peers = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(v) = std::env::var("AETHER_CACHE_BACKING_URL") {
            self.cache.backing_url = Some(v);
        }

        if let Ok(v) = std::env::var("AETHER_CRYPTO_ENDPOINT") {
            self.oracle.crypto_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AETHER_FORECASTER_ENDPOINT") {
            self.oracle.forecaster_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AETHER_NAMESERVICE_ENDPOINT") {
            self.oracle.nameservice_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("AETHER_LEDGER_ENDPOINT") {
            self.oracle.ledger_endpoint = Some(v);
        }

        if let Ok(v) = std::env::var("AETHER_SNAPSHOT_PATH") {
            self.persist.snapshot_path = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.market.safety_margin) {
            anyhow::bail!(
                "market.safety_margin must be in [0, 1), got {}",
                self.market.safety_margin
            );
        }

        if self.market.bands.is_empty() {
            anyhow::bail!("market.bands cannot be empty");
        }
        for band in &self.market.bands {
            if band.freq_low_mhz >= band.freq_high_mhz {
                anyhow::bail!(
                    "band '{}' has an empty frequency range ({} >= {})",
                    band.name,
                    band.freq_low_mhz,
                    band.freq_high_mhz
                );
            }
            if band.capacity_mbps == 0 {
                anyhow::bail!("band '{}' has zero capacity", band.name);
            }
            if !(0.0..=1.0).contains(&band.reliability) {
                anyhow::bail!("band '{}' reliability must be in [0, 1]", band.name);
            }
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            anyhow::bail!("cluster.heartbeat_interval_ms must be positive");
        }
        if self.cluster.failover_threshold == 0 {
            anyhow::bail!("cluster.failover_threshold must be at least 1");
        }
        if self.cluster.election_timeout_ms <= self.cluster.heartbeat_interval_ms {
            anyhow::bail!("cluster.election_timeout_ms must exceed the heartbeat interval");
        }
        for peer in &self.cluster.peers {
            if peer.is_empty() {
                anyhow::bail!("cluster.peers entries cannot be empty");
            }
        }

        for (class, pool) in &self.pool {
            if pool.max_size == 0 {
                anyhow::bail!("pool.{}.max_size must be positive", class);
            }
            if pool.min_size > pool.max_size {
                anyhow::bail!(
                    "pool.{}.min_size ({}) exceeds max_size ({})",
                    class,
                    pool.min_size,
                    pool.max_size
                );
            }
        }

        for rule in &self.alerts.thresholds {
            let (name, t) = rule;
            if t.comparison != "ge" && t.comparison != "le" {
                anyhow::bail!(
                    "alerts.thresholds.{}.comparison must be \"ge\" or \"le\"",
                    name
                );
            }
            if t.warning.is_none() && t.error.is_none() && t.critical.is_none() {
                anyhow::bail!("alerts.thresholds.{} defines no severity levels", name);
            }
        }

        for ch in &self.notifications.channels {
            match ch.kind.as_str() {
                "chat" | "email" | "pager" => {}
                other => anyhow::bail!("notifications channel kind '{}' is not supported", other),
            }
        }

        if self.metrics.aggregation_windows_ms.is_empty() {
            anyhow::bail!("metrics.aggregation_windows_ms cannot be empty");
        }

        Ok(())
    }
}
