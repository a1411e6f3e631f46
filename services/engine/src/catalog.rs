//! Formula version catalog.
//!
//! Persists the (calculator, version) pairs the engine last ran with.
//! A reload (at startup or on SIGHUP) compares the stored catalog with
//! the compiled registry; any version bump enqueues a
//! `recompute_violations` job with trigger `formula_version_change` so
//! historical violations are regenerated under the new formulas.

use crate::recalc::queue::JobStore;
use crate::recalc::{JobKind, JobScope, JobTrigger, NewJob};
use crate::store::StoreError;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, u32>, StoreError>;
    async fn save(&self, entries: &[(&'static str, u32)]) -> Result<(), StoreError>;
}

pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        PgCatalogStore { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn load(&self) -> Result<HashMap<String, u32>, StoreError> {
        let rows = sqlx::query("SELECT calculator, version FROM calculator_catalog")
            .fetch_all(&self.pool)
            .await?;
        let mut catalog = HashMap::with_capacity(rows.len());
        for row in rows {
            catalog.insert(
                row.try_get::<String, _>("calculator")?,
                u32::try_from(row.try_get::<i32, _>("version")?).unwrap_or(0),
            );
        }
        Ok(catalog)
    }

    async fn save(&self, entries: &[(&'static str, u32)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (name, version) in entries {
            sqlx::query(
                r"INSERT INTO calculator_catalog (calculator, version)
                  VALUES ($1, $2)
                  ON CONFLICT (calculator) DO UPDATE SET version = EXCLUDED.version",
            )
            .bind(*name)
            .bind(i32::try_from(*version).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCatalogStore {
    catalog: Mutex<HashMap<String, u32>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        MemoryCatalogStore::default()
    }

    pub fn preset(&self, name: &str, version: u32) {
        self.catalog
            .lock()
            .expect("catalog mutex poisoned")
            .insert(name.to_owned(), version);
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load(&self) -> Result<HashMap<String, u32>, StoreError> {
        Ok(self.catalog.lock().expect("catalog mutex poisoned").clone())
    }

    async fn save(&self, entries: &[(&'static str, u32)]) -> Result<(), StoreError> {
        let mut catalog = self.catalog.lock().expect("catalog mutex poisoned");
        for (name, version) in entries {
            catalog.insert((*name).to_owned(), *version);
        }
        Ok(())
    }
}

/// Compare registry versions with the stored catalog; persist the current
/// versions and enqueue a recomputation when any version moved. Returns
/// the names whose formulas changed.
pub async fn reload_catalog(
    registry_versions: &[(&'static str, u32)],
    catalog: &Arc<dyn CatalogStore>,
    jobs: &Arc<dyn JobStore>,
) -> Result<Vec<&'static str>, StoreError> {
    let stored = catalog.load().await?;
    let changed: Vec<&'static str> = registry_versions
        .iter()
        .filter(|(name, version)| stored.get(*name).copied().unwrap_or(0) != *version)
        .map(|(name, _)| *name)
        .collect();

    catalog.save(registry_versions).await?;

    // First boot (empty catalog) is a baseline, not a formula change.
    if stored.is_empty() || changed.is_empty() {
        return Ok(Vec::new());
    }

    let reason = format!("formula:{}", changed.join(","));
    let id = jobs
        .enqueue(NewJob {
            kind: JobKind::RecomputeViolations,
            trigger: JobTrigger::FormulaVersionChange,
            priority: 1,
            reason: Some(reason.clone()),
            scope: JobScope::unbounded(),
        })
        .await?;
    info!(job = id, %reason, "formula change detected, recomputation enqueued");
    Ok(changed)
}
