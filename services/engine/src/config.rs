//! Engine configuration.

use fleet_infra::config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Zero derives batch_size x 4.
    #[serde(default)]
    pub prefetch: u16,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,
    /// Calculators run and log, but no writes and no outbound alarms.
    #[serde(default)]
    pub shadow_mode: bool,
    /// Seconds between recalculation queue polls.
    #[serde(default = "default_recalc_poll")]
    pub recalc_poll_interval: u64,
    /// Lease granted to a claimed job before it becomes reclaimable.
    #[serde(default = "default_lease")]
    pub job_lease: u64,
    /// Seconds between scheduled full view refreshes.
    #[serde(default = "default_refresh_interval")]
    pub scheduled_refresh_interval: u64,
    #[serde(default = "default_refresh_delay")]
    pub scheduled_refresh_initial_delay: u64,
    /// Device-config cache TTL, seconds.
    #[serde(default = "default_enrichment_ttl")]
    pub enrichment_ttl: u64,
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            workers: default_workers(),
            prefetch: 0,
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            shadow_mode: false,
            recalc_poll_interval: default_recalc_poll(),
            job_lease: default_lease(),
            scheduled_refresh_interval: default_refresh_interval(),
            scheduled_refresh_initial_delay: default_refresh_delay(),
            enrichment_ttl: default_enrichment_ttl(),
            health_bind: default_health_bind(),
        }
    }
}

impl EngineSection {
    pub fn batch_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.batch_timeout)
    }

    pub fn effective_prefetch(&self) -> u16 {
        if self.prefetch > 0 {
            self.prefetch
        } else {
            u16::try_from(self.batch_size.saturating_mul(4)).unwrap_or(u16::MAX)
        }
    }
}

pub fn load_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    fleet_infra::config::load_config(path)
}

fn default_workers() -> usize {
    2
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout() -> u64 {
    5
}
fn default_recalc_poll() -> u64 {
    60
}
fn default_lease() -> u64 {
    300
}
fn default_refresh_interval() -> u64 {
    86_400
}
fn default_refresh_delay() -> u64 {
    300
}
fn default_enrichment_ttl() -> u64 {
    300
}
fn default_health_bind() -> String {
    "0.0.0.0:9102".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_mode_defaults_off() {
        let toml_str = r#"
            [broker]
            user = "guest"
            password = "guest"

            [database]
            name = "fleet"
            user = "fleet"
            password = "fleet"

            [engine]
            shadow_mode = true
        "#;
        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.engine.shadow_mode);
        assert_eq!(cfg.engine.scheduled_refresh_interval, 86_400);
        assert!(!EngineSection::default().shadow_mode);
    }
}
