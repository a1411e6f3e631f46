//! Engine persistence: metric rows, violation rows, telemetry reads for
//! recomputation, and derived-view refresh.

use crate::calculators::{MetricEvent, ViolationEvent};
use crate::recalc::{JobScope, DERIVED_VIEWS};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet_proto::{NetworkType, Position, TelemetryRecord};
use sqlx::{PgPool, QueryBuilder, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("unknown derived view '{0}'")]
    UnknownView(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
            StoreError::Db(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40001" | "40P01"))
            }
            StoreError::Db(_) | StoreError::UnknownView(_) => false,
            StoreError::Unavailable(_) => true,
        }
    }
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Flush one batch of side effects in a single transaction.
    async fn write_batch(
        &self,
        metrics: &[MetricEvent],
        violations: &[ViolationEvent],
    ) -> Result<(), StoreError>;

    /// Delete violation rows in scope; recomputation regenerates them.
    async fn clear_violations(&self, scope: &JobScope) -> Result<u64, StoreError>;

    /// Source telemetry for a recomputation, time-ascending.
    async fn fetch_telemetry(&self, scope: &JobScope) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// Refresh one derived view by name (must be in [`DERIVED_VIEWS`]).
    async fn refresh_view(&self, name: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgEngineStore {
    pool: PgPool,
}

impl PgEngineStore {
    pub fn new(pool: PgPool) -> Self {
        PgEngineStore { pool }
    }
}

// Explicit wide bounds for unbounded scopes; chrono's extreme values are
// outside the Postgres timestamp range.
fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn scope_bounds(scope: &JobScope) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = scope
        .date_from
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::UNIX_EPOCH, |naive| Utc.from_utc_datetime(&naive));
    let to = scope
        .date_to
        .and_then(|d| d.succ_opt())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or_else(far_future, |naive| Utc.from_utc_datetime(&naive));
    (from, to)
}

#[async_trait]
impl EngineStore for PgEngineStore {
    async fn write_batch(
        &self,
        metrics: &[MetricEvent],
        violations: &[ViolationEvent],
    ) -> Result<(), StoreError> {
        if metrics.is_empty() && violations.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        if !metrics.is_empty() {
            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO metric_events (identity, metric, value, recorded_at) ",
            );
            builder.push_values(metrics, |mut b, m| {
                b.push_bind(m.identity.as_str().to_owned())
                    .push_bind(m.name)
                    .push_bind(m.value)
                    .push_bind(m.at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        if !violations.is_empty() {
            let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO violations (identity, rule, started_at, ended_at, value) ",
            );
            builder.push_values(violations, |mut b, v| {
                b.push_bind(v.identity.as_str().to_owned())
                    .push_bind(v.rule)
                    .push_bind(v.started_at)
                    .push_bind(v.ended_at)
                    .push_bind(v.value);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear_violations(&self, scope: &JobScope) -> Result<u64, StoreError> {
        let (from, to) = scope_bounds(scope);
        let result = sqlx::query(
            r"DELETE FROM violations
              WHERE started_at >= $1 AND started_at < $2
                AND ($3::text IS NULL OR identity = $3)
                AND ($4::bigint IS NULL
                     OR identity IN (SELECT identity FROM device_config WHERE tenant_id = $4))",
        )
        .bind(from)
        .bind(to)
        .bind(scope.identity.as_ref().map(|i| i.as_str().to_owned()))
        .bind(scope.tenant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_telemetry(&self, scope: &JobScope) -> Result<Vec<TelemetryRecord>, StoreError> {
        let (from, to) = scope_bounds(scope);
        let rows = sqlx::query(
            r"SELECT identity, sequence, recorded_at, timestamp_valid, latitude, longitude,
                     altitude, heading, speed, satellites, ignition, mileage_m, network,
                     fingerprint
              FROM telemetry
              WHERE recorded_at >= $1 AND recorded_at < $2
                AND ($3::text IS NULL OR identity = $3)
                AND ($4::bigint IS NULL
                     OR identity IN (SELECT identity FROM device_config WHERE tenant_id = $4))
              ORDER BY identity, recorded_at ASC",
        )
        .bind(from)
        .bind(to)
        .bind(scope.identity.as_ref().map(|i| i.as_str().to_owned()))
        .bind(scope.tenant)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let identity: String = row.try_get("identity")?;
            let Ok(identity) = identity.parse() else {
                continue;
            };
            let network = match row.try_get::<String, _>("network")?.as_str() {
                "gsm" => NetworkType::Gsm,
                "umts" => NetworkType::Umts,
                "lte" => NetworkType::Lte,
                _ => NetworkType::Unknown,
            };
            records.push(TelemetryRecord {
                identity,
                sequence: u64::try_from(row.try_get::<i64, _>("sequence")?).unwrap_or(0),
                timestamp: row.try_get("recorded_at")?,
                timestamp_valid: row.try_get("timestamp_valid")?,
                position: Position {
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                    altitude: i16::try_from(row.try_get::<i32, _>("altitude")?).unwrap_or(0),
                    heading: u16::try_from(row.try_get::<i32, _>("heading")?).unwrap_or(0),
                    speed: u16::try_from(row.try_get::<i32, _>("speed")?).unwrap_or(0),
                    satellites: u8::try_from(row.try_get::<i32, _>("satellites")?).unwrap_or(0),
                },
                io: std::collections::BTreeMap::new(),
                ignition: row.try_get("ignition")?,
                mileage_m: row
                    .try_get::<Option<i64>, _>("mileage_m")?
                    .and_then(|m| u64::try_from(m).ok()),
                network,
                fingerprint: row.try_get("fingerprint")?,
            });
        }
        Ok(records)
    }

    async fn refresh_view(&self, name: &str) -> Result<(), StoreError> {
        if !DERIVED_VIEWS.contains(&name) {
            return Err(StoreError::UnknownView(name.to_owned()));
        }
        sqlx::query(&format!("REFRESH MATERIALIZED VIEW {name}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryEngineState {
    metrics: Vec<MetricEvent>,
    violations: Vec<ViolationEvent>,
    telemetry: Vec<TelemetryRecord>,
    refreshed: Vec<String>,
}

#[derive(Default)]
pub struct MemoryEngineStore {
    state: Mutex<MemoryEngineState>,
    failing: AtomicBool,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        MemoryEngineStore::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn seed_telemetry(&self, records: Vec<TelemetryRecord>) {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .telemetry
            .extend(records);
    }

    pub fn metrics(&self) -> Vec<MetricEvent> {
        self.state.lock().expect("store mutex poisoned").metrics.clone()
    }

    pub fn violations(&self) -> Vec<ViolationEvent> {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .violations
            .clone()
    }

    pub fn refreshed_views(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .refreshed
            .clone()
    }
}

fn in_scope(record: &TelemetryRecord, scope: &JobScope) -> bool {
    if let Some(identity) = &scope.identity {
        if &record.identity != identity {
            return false;
        }
    }
    if let Some(from) = scope.date_from {
        if record.timestamp.date_naive() < from {
            return false;
        }
    }
    if let Some(to) = scope.date_to {
        if record.timestamp.date_naive() > to {
            return false;
        }
    }
    true
}

#[async_trait]
impl EngineStore for MemoryEngineStore {
    async fn write_batch(
        &self,
        metrics: &[MetricEvent],
        violations: &[ViolationEvent],
    ) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.metrics.extend_from_slice(metrics);
        state.violations.extend_from_slice(violations);
        Ok(())
    }

    async fn clear_violations(&self, scope: &JobScope) -> Result<u64, StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let mut state = self.state.lock().expect("store mutex poisoned");
        let before = state.violations.len();
        let scope = scope.clone();
        state.violations.retain(|v| {
            let record_like = TelemetryRecord {
                identity: v.identity.clone(),
                sequence: 0,
                timestamp: v.started_at,
                timestamp_valid: true,
                position: Position {
                    latitude: 0.0,
                    longitude: 0.0,
                    altitude: 0,
                    heading: 0,
                    speed: 0,
                    satellites: 0,
                },
                io: std::collections::BTreeMap::new(),
                ignition: false,
                mileage_m: None,
                network: NetworkType::Unknown,
                fingerprint: String::new(),
            };
            !in_scope(&record_like, &scope)
        });
        Ok((before - state.violations.len()) as u64)
    }

    async fn fetch_telemetry(&self, scope: &JobScope) -> Result<Vec<TelemetryRecord>, StoreError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store failing".into()));
        }
        let state = self.state.lock().expect("store mutex poisoned");
        let mut records: Vec<_> = state
            .telemetry
            .iter()
            .filter(|r| in_scope(r, scope))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.identity
                .cmp(&b.identity)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(records)
    }

    async fn refresh_view(&self, name: &str) -> Result<(), StoreError> {
        if !DERIVED_VIEWS.contains(&name) {
            return Err(StoreError::UnknownView(name.to_owned()));
        }
        self.state
            .lock()
            .expect("store mutex poisoned")
            .refreshed
            .push(name.to_owned());
        Ok(())
    }
}
