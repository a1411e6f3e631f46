//! Consumer configuration.

use fleet_infra::config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub consumer: ConsumerSection,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSection {
    /// Independent workers per queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Unacked delivery window per worker. Zero means derive it from
    /// `batch_size` (batch_size x 4) to bound memory.
    #[serde(default)]
    pub prefetch: u16,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds from the first record of a batch until a forced flush.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,
    /// L1 dedup cache entries kept in memory.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        ConsumerSection {
            workers: default_workers(),
            prefetch: 0,
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            dedup_capacity: default_dedup_capacity(),
            health_bind: default_health_bind(),
        }
    }
}

impl ConsumerSection {
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

pub fn load_from_path(path: &Path) -> Result<ConsumerConfig, ConfigError> {
    fleet_infra::config::load_config(path)
}

fn default_workers() -> usize {
    3
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout() -> u64 {
    5
}
fn default_dedup_capacity() -> usize {
    100_000
}
fn default_health_bind() -> String {
    "0.0.0.0:9101".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_derives_from_batch_size() {
        let section = ConsumerSection::default();
        assert_eq!(section.effective_prefetch(), 400);

        let explicit = ConsumerSection {
            prefetch: 64,
            ..ConsumerSection::default()
        };
        assert_eq!(explicit.effective_prefetch(), 64);
    }
}
