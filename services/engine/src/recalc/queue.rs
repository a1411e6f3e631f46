//! The durable job queue.
//!
//! Claiming is `FOR UPDATE SKIP LOCKED` over the lowest-priority pending
//! row, or a running row whose lease expired, which is how a crashed
//! worker's job becomes reclaimable. A job leaves `pending` exactly once;
//! only lease expiry puts it back in contention.

use crate::recalc::{Job, JobKind, JobScope, JobTrigger, NewJob};
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError>;

    /// Claim the most urgent due job, granting `lease` of exclusive
    /// execution time.
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, StoreError>;

    async fn complete(&self, id: i64) -> Result<(), StoreError>;

    async fn fail(&self, id: i64) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        PgJobStore { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r"INSERT INTO recalculation_queue
                  (job_kind, trigger, status, priority, reason,
                   scope_identity, scope_tenant, scope_date_from, scope_date_to)
              VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8)
              RETURNING id",
        )
        .bind(job.kind.as_str())
        .bind(job.trigger.as_str())
        .bind(job.priority)
        .bind(&job.reason)
        .bind(job.scope.identity.as_ref().map(|i| i.as_str().to_owned()))
        .bind(job.scope.tenant)
        .bind(job.scope.date_from)
        .bind(job.scope.date_to)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r"UPDATE recalculation_queue
              SET status = 'running',
                  claimed_at = NOW(),
                  lease_expires_at = NOW() + make_interval(secs => $1)
              WHERE id = (
                  SELECT id FROM recalculation_queue
                  WHERE status = 'pending'
                     OR (status = 'running' AND lease_expires_at < NOW())
                  ORDER BY priority ASC, id ASC
                  LIMIT 1
                  FOR UPDATE SKIP LOCKED
              )
              RETURNING id, job_kind, trigger, priority, reason,
                        scope_identity, scope_tenant, scope_date_from, scope_date_to",
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let kind: String = row.try_get("job_kind")?;
        let trigger: String = row.try_get("trigger")?;
        let identity: Option<String> = row.try_get("scope_identity")?;
        Ok(Some(Job {
            id: row.try_get("id")?,
            kind: JobKind::parse(&kind).unwrap_or(JobKind::RefreshAllViews),
            trigger: JobTrigger::parse(&trigger).unwrap_or(JobTrigger::Manual),
            priority: row.try_get("priority")?,
            reason: row.try_get("reason")?,
            scope: JobScope {
                identity: identity.and_then(|i| i.parse().ok()),
                tenant: row.try_get("scope_tenant")?,
                date_from: row.try_get("scope_date_from")?,
                date_to: row.try_get("scope_date_to")?,
            },
        }))
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE recalculation_queue SET status = 'done', lease_expires_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE recalculation_queue SET status = 'failed', lease_expires_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryJobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct MemoryJob {
    job: Job,
    status: MemoryJobStatus,
    lease_expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<MemoryJob>>,
    next_id: Mutex<i64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        MemoryJobStore::default()
    }

    pub fn status_of(&self, id: i64) -> Option<MemoryJobStatus> {
        self.jobs
            .lock()
            .expect("job mutex poisoned")
            .iter()
            .find(|j| j.job.id == id)
            .map(|j| j.status.clone())
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let jobs = self.jobs.lock().expect("job mutex poisoned");
        let count = |s: MemoryJobStatus| jobs.iter().filter(|j| j.status == s).count();
        (
            count(MemoryJobStatus::Pending),
            count(MemoryJobStatus::Running),
            count(MemoryJobStatus::Done),
            count(MemoryJobStatus::Failed),
        )
    }

    /// Any job running with an expired lease? Healthy queues converge to
    /// "no".
    pub fn has_expired_running(&self) -> bool {
        let now = Instant::now();
        self.jobs
            .lock()
            .expect("job mutex poisoned")
            .iter()
            .any(|j| {
                j.status == MemoryJobStatus::Running
                    && j.lease_expires_at.is_some_and(|at| at < now)
            })
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        let mut next_id = self.next_id.lock().expect("id mutex poisoned");
        *next_id += 1;
        let id = *next_id;
        drop(next_id);

        self.jobs.lock().expect("job mutex poisoned").push(MemoryJob {
            job: Job {
                id,
                kind: job.kind,
                trigger: job.trigger,
                priority: job.priority,
                reason: job.reason,
                scope: job.scope,
            },
            status: MemoryJobStatus::Pending,
            lease_expires_at: None,
        });
        Ok(id)
    }

    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().expect("job mutex poisoned");
        let now = Instant::now();
        let candidate = jobs
            .iter_mut()
            .filter(|j| {
                j.status == MemoryJobStatus::Pending
                    || (j.status == MemoryJobStatus::Running
                        && j.lease_expires_at.is_some_and(|at| at < now))
            })
            .min_by_key(|j| (j.job.priority, j.job.id));

        Ok(candidate.map(|j| {
            j.status = MemoryJobStatus::Running;
            j.lease_expires_at = Some(now + lease);
            j.job.clone()
        }))
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("job mutex poisoned");
        if let Some(j) = jobs.iter_mut().find(|j| j.job.id == id) {
            j.status = MemoryJobStatus::Done;
            j.lease_expires_at = None;
        }
        Ok(())
    }

    async fn fail(&self, id: i64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("job mutex poisoned");
        if let Some(j) = jobs.iter_mut().find(|j| j.job.id == id) {
            j.status = MemoryJobStatus::Failed;
            j.lease_expires_at = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(kind: JobKind, priority: i32) -> NewJob {
        NewJob {
            kind,
            trigger: JobTrigger::Manual,
            priority,
            reason: None,
            scope: JobScope::unbounded(),
        }
    }

    #[tokio::test]
    async fn claims_lowest_priority_first() {
        let store = MemoryJobStore::new();
        store.enqueue(job(JobKind::RefreshAllViews, 5)).await.unwrap();
        let urgent = store
            .enqueue(job(JobKind::RecomputeViolations, 1))
            .await
            .unwrap();

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, urgent);
    }

    #[tokio::test]
    async fn running_job_is_invisible_until_lease_expires() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(job(JobKind::RefreshAllViews, 2)).await.unwrap();

        let first = store.claim_next(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.unwrap().id, id);
        // Still leased: nothing to claim.
        assert!(store
            .claim_next(Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Lease expired: the same job is reclaimable.
        let reclaimed = store.claim_next(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reclaimed.unwrap().id, id);
    }

    #[tokio::test]
    async fn completed_job_is_never_reclaimed() {
        let store = MemoryJobStore::new();
        let id = store.enqueue(job(JobKind::RefreshAllViews, 2)).await.unwrap();
        store.claim_next(Duration::from_secs(60)).await.unwrap();
        store.complete(id).await.unwrap();
        assert!(store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.status_of(id), Some(MemoryJobStatus::Done));
    }
}
