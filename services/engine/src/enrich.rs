//! Enrichment: per-device configuration resolved by identity, cached with
//! a TTL so a busy device costs one lookup per window.

use async_trait::async_trait;
use fleet_proto::Identity;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

/// Per-device configuration as the calculators consume it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub speed_limit_kph: u16,
    pub idle_threshold: Duration,
    pub tenant_id: Option<i64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            speed_limit_kph: 80,
            idle_threshold: Duration::from_secs(300),
            tenant_id: None,
        }
    }
}

/// Where device configuration comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DeviceConfig>, EnrichError>;
}

pub struct PgConfigSource {
    pool: PgPool,
}

impl PgConfigSource {
    pub fn new(pool: PgPool) -> Self {
        PgConfigSource { pool }
    }
}

#[async_trait]
impl ConfigSource for PgConfigSource {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DeviceConfig>, EnrichError> {
        let row = sqlx::query(
            r"SELECT speed_limit_kph, idle_threshold_secs, tenant_id
              FROM device_config WHERE identity = $1",
        )
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(DeviceConfig {
            speed_limit_kph: u16::try_from(row.try_get::<i32, _>("speed_limit_kph")?)
                .unwrap_or(u16::MAX),
            idle_threshold: Duration::from_secs(
                u64::try_from(row.try_get::<i32, _>("idle_threshold_secs")?).unwrap_or(300),
            ),
            tenant_id: row.try_get("tenant_id")?,
        }))
    }
}

/// Static map source for tests.
#[derive(Default)]
pub struct MemoryConfigSource {
    configs: std::sync::Mutex<HashMap<Identity, DeviceConfig>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        MemoryConfigSource::default()
    }

    pub fn set(&self, identity: Identity, config: DeviceConfig) {
        self.configs
            .lock()
            .expect("config mutex poisoned")
            .insert(identity, config);
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn fetch(&self, identity: &Identity) -> Result<Option<DeviceConfig>, EnrichError> {
        Ok(self
            .configs
            .lock()
            .expect("config mutex poisoned")
            .get(identity)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    config: DeviceConfig,
    fetched_at: Instant,
}

/// TTL cache in front of a [`ConfigSource`]. Misses and lookup failures
/// fall back to defaults; the pipeline never stalls on enrichment.
pub struct EnrichmentCache {
    source: std::sync::Arc<dyn ConfigSource>,
    ttl: Duration,
    entries: HashMap<Identity, CacheEntry>,
}

impl EnrichmentCache {
    pub fn new(source: std::sync::Arc<dyn ConfigSource>, ttl: Duration) -> Self {
        EnrichmentCache {
            source,
            ttl,
            entries: HashMap::new(),
        }
    }

    pub async fn get(&mut self, identity: &Identity) -> DeviceConfig {
        if let Some(entry) = self.entries.get(identity) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.config.clone();
            }
        }

        let config = match self.source.fetch(identity).await {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::default(),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "config lookup failed, using defaults");
                DeviceConfig::default()
            }
        };
        self.entries.insert(
            identity.clone(),
            CacheEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        config
    }

    /// Drop everything; the next record re-resolves. Used on catalog reload.
    pub fn invalidate(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn identity() -> Identity {
        "123456789012345".parse().unwrap()
    }

    #[tokio::test]
    async fn miss_falls_back_to_defaults() {
        let source = Arc::new(MemoryConfigSource::new());
        let mut cache = EnrichmentCache::new(source, Duration::from_secs(60));
        assert_eq!(cache.get(&identity()).await, DeviceConfig::default());
    }

    #[tokio::test]
    async fn hit_is_cached_until_ttl() {
        let source = Arc::new(MemoryConfigSource::new());
        source.set(
            identity(),
            DeviceConfig {
                speed_limit_kph: 100,
                ..DeviceConfig::default()
            },
        );
        let mut cache = EnrichmentCache::new(Arc::clone(&source) as Arc<dyn ConfigSource>, Duration::from_secs(60));
        assert_eq!(cache.get(&identity()).await.speed_limit_kph, 100);

        // A config change is invisible until the TTL or an invalidate.
        source.set(
            identity(),
            DeviceConfig {
                speed_limit_kph: 60,
                ..DeviceConfig::default()
            },
        );
        assert_eq!(cache.get(&identity()).await.speed_limit_kph, 100);
        cache.invalidate();
        assert_eq!(cache.get(&identity()).await.speed_limit_kph, 60);
    }
}
