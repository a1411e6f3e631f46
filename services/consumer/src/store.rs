//! Telemetry persistence: capability trait, Postgres implementation, and
//! the recording fake used by the worker tests.

use crate::queue::{QueueKind, StoredRecord};
use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are retried with backoff; everything else fails
    /// the batch immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
            StoreError::Db(sqlx::Error::Database(db)) => {
                // Deadlocks and serialization failures.
                matches!(db.code().as_deref(), Some("40001" | "40P01"))
            }
            StoreError::Db(_) => false,
            StoreError::Unavailable(_) => true,
        }
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert the whole batch into the queue's target table in one
    /// transaction: all rows or none.
    async fn insert_batch(
        &self,
        queue: QueueKind,
        records: &[StoredRecord],
    ) -> Result<(), StoreError>;

    /// L2 dedup: which of these keys already exist durably?
    async fn filter_existing(
        &self,
        queue: QueueKind,
        keys: &[String],
    ) -> Result<HashSet<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgTelemetryStore {
    pool: PgPool,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        PgTelemetryStore { pool }
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn insert_batch(
        &self,
        queue: QueueKind,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (identity, sequence, recorded_at, timestamp_valid, latitude, \
             longitude, altitude, heading, speed, satellites, ignition, mileage_m, network, \
             io, fingerprint, dedup_key{}) ",
            queue.target_table(),
            if queue == QueueKind::Alarms {
                ", alarm_kind, severity"
            } else {
                ""
            }
        ));
        builder.push_values(records, |mut b, stored| {
            let r = &stored.record;
            b.push_bind(r.identity.as_str().to_owned())
                .push_bind(i64::try_from(r.sequence).unwrap_or(i64::MAX))
                .push_bind(r.timestamp)
                .push_bind(r.timestamp_valid)
                .push_bind(r.position.latitude)
                .push_bind(r.position.longitude)
                .push_bind(i32::from(r.position.altitude))
                .push_bind(i32::from(r.position.heading))
                .push_bind(i32::from(r.position.speed))
                .push_bind(i32::from(r.position.satellites))
                .push_bind(r.ignition)
                .push_bind(r.mileage_m.map(|m| i64::try_from(m).unwrap_or(i64::MAX)))
                .push_bind(format!("{:?}", r.network).to_lowercase())
                .push_bind(serde_json::to_value(&r.io).unwrap_or_default())
                .push_bind(r.fingerprint.clone())
                .push_bind(r.dedup_key());
            if queue == QueueKind::Alarms {
                b.push_bind(
                    stored
                        .alarm_kind
                        .map(|k| format!("{k:?}").to_lowercase()),
                )
                .push_bind(stored.severity.map(|s| format!("{s:?}").to_lowercase()));
            }
        });
        // The unique index on dedup_key is the durable L2 guard; a replayed
        // row that slipped past both cache levels is dropped here instead
        // of failing the batch.
        builder.push(" ON CONFLICT (dedup_key) DO NOTHING");

        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn filter_existing(
        &self,
        queue: QueueKind,
        keys: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT dedup_key FROM {} WHERE dedup_key = ANY($1)",
            queue.target_table()
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        let mut existing = HashSet::with_capacity(rows.len());
        for row in rows {
            existing.insert(row.try_get::<String, _>("dedup_key")?);
        }
        Ok(existing)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

/// Recording fake with a unique-key guard and a switchable failure mode.
#[derive(Default)]
pub struct MemoryTelemetryStore {
    rows: Mutex<Vec<(QueueKind, StoredRecord)>>,
    failing: AtomicBool,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        MemoryTelemetryStore::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn rows(&self, queue: QueueKind) -> Vec<StoredRecord> {
        self.rows
            .lock()
            .expect("store mutex poisoned")
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn row_count(&self, queue: QueueKind) -> usize {
        self.rows(queue).len()
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn insert_batch(
        &self,
        queue: QueueKind,
        records: &[StoredRecord],
    ) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let mut rows = self.rows.lock().expect("store mutex poisoned");
        for stored in records {
            let key = stored.record.dedup_key();
            let exists = rows
                .iter()
                .any(|(q, r)| *q == queue && r.record.dedup_key() == key);
            if !exists {
                rows.push((queue, stored.clone()));
            }
        }
        Ok(())
    }

    async fn filter_existing(
        &self,
        queue: QueueKind,
        keys: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let rows = self.rows.lock().expect("store mutex poisoned");
        Ok(rows
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, r)| r.record.dedup_key())
            .filter(|k| keys.contains(k))
            .collect())
    }
}
