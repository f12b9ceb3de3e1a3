use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mdns::interfaces::DEFAULT_EXCLUDED_INTERFACES;
use crate::mdns::server::DEFAULT_MDNS_TLD;
use crate::mdns::Backoff;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Host name of this node. Announced when it ends in `tld`.
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<IpAddr>,
    pub tld: String,
    /// Interface name patterns never listened on.
    pub excluded_interfaces: Vec<String>,
    pub ipv4: bool,
    pub ipv6: bool,
    /// Route list to watch. Without it no route hosts are published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes_file: Option<PathBuf>,
    pub routes_poll_interval_secs: u64,
    pub route_api_backoff: BackoffConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    pub initial_secs: u64,
    pub factor: f64,
    pub cap_secs: u64,
    pub steps: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: 10,
            factor: 1.5,
            cap_secs: 180,
            steps: 24,
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(cfg: &BackoffConfig) -> Self {
        Backoff {
            initial: Duration::from_secs(cfg.initial_secs),
            factor: cfg.factor,
            cap: Duration::from_secs(cfg.cap_secs),
            steps: cfg.steps,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_default(),
            node_ip: None,
            tld: DEFAULT_MDNS_TLD.into(),
            excluded_interfaces: DEFAULT_EXCLUDED_INTERFACES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            ipv4: true,
            ipv6: true,
            routes_file: None,
            routes_poll_interval_secs: 5,
            route_api_backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("nodemdns.toml"))
            .merge(Json::file("nodemdns.json"))
            .merge(Env::prefixed("NODEMDNS_").split("__"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tld.trim_matches('.').is_empty() {
            anyhow::bail!("Invalid configuration: tld must not be empty");
        }
        for pattern in &self.excluded_interfaces {
            Regex::new(pattern).map_err(|e| {
                anyhow::anyhow!("Invalid excluded_interfaces pattern {:?}: {}", pattern, e)
            })?;
        }
        let backoff = &self.route_api_backoff;
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            anyhow::bail!(
                "Invalid configuration: route_api_backoff.factor must be a finite number >= 1, got {}",
                backoff.factor
            );
        }
        if backoff.steps == 0 {
            anyhow::bail!("Invalid configuration: route_api_backoff.steps must be positive");
        }
        if self.routes_poll_interval_secs == 0 {
            anyhow::bail!("Invalid configuration: routes_poll_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn routes_poll_interval(&self) -> Duration {
        Duration::from_secs(self.routes_poll_interval_secs)
    }
}
