//! Recalculation worker: drains the durable job queue.
//!
//! `recompute_violations` is idempotent by construction: clear the scope,
//! replay the source telemetry through a fresh violation registry, insert
//! what comes out. Running it twice produces the same final state.

use crate::calculators::{build_violation_registry, CalcEvent, ViolationEvent};
use crate::enrich::{ConfigSource, EnrichmentCache};
use crate::metrics::EngineMetrics;
use crate::recalc::queue::JobStore;
use crate::recalc::{Job, JobKind, DERIVED_VIEWS};
use crate::store::{EngineStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct RecalcWorker {
    pub jobs: Arc<dyn JobStore>,
    pub store: Arc<dyn EngineStore>,
    pub config_source: Arc<dyn ConfigSource>,
    pub metrics: Arc<EngineMetrics>,
    pub poll_interval: Duration,
    pub lease: Duration,
}

impl RecalcWorker {
    /// Poll-claim-execute until shutdown. Executes at most one job at a
    /// time per worker; parallelism comes from running several workers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let claimed = match self.jobs.claim_next(self.lease).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "job claim failed");
                    None
                }
            };

            match claimed {
                Some(job) => {
                    let id = job.id;
                    let kind = job.kind;
                    info!(job = id, kind = kind.as_str(), "recalculation job claimed");
                    match self.execute(&job).await {
                        Ok(()) => {
                            if let Err(e) = self.jobs.complete(id).await {
                                error!(job = id, error = %e, "marking job done failed");
                            }
                            self.metrics
                                .jobs_total
                                .with_label_values(&[kind.as_str(), "done"])
                                .inc();
                            info!(job = id, "recalculation job done");
                        }
                        Err(e) => {
                            warn!(job = id, error = %e, "recalculation job failed");
                            if let Err(e) = self.jobs.fail(id).await {
                                error!(job = id, error = %e, "marking job failed failed");
                            }
                            self.metrics
                                .jobs_total
                                .with_label_values(&[kind.as_str(), "failed"])
                                .inc();
                        }
                    }
                    // Immediately look for the next due job.
                    if *shutdown.borrow() {
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.wait_for(|v| *v) => break,
                        () = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!("recalculation worker stopped");
    }

    async fn execute(&self, job: &Job) -> Result<(), StoreError> {
        match job.kind {
            JobKind::RecomputeViolations => self.recompute_violations(job).await,
            JobKind::RefreshSingleView => {
                let name = job.reason.as_deref().unwrap_or("");
                self.store.refresh_view(name).await
            }
            JobKind::RefreshAllViews => {
                for view in DERIVED_VIEWS {
                    self.store.refresh_view(view).await?;
                }
                Ok(())
            }
        }
    }

    async fn recompute_violations(&self, job: &Job) -> Result<(), StoreError> {
        let records = self.store.fetch_telemetry(&job.scope).await?;
        let cleared = self.store.clear_violations(&job.scope).await?;

        // Fresh calculator instances: replay starts from clean state.
        let mut registry = build_violation_registry();
        let mut enrichment = EnrichmentCache::new(
            Arc::clone(&self.config_source),
            Duration::from_secs(3600),
        );

        let mut violations: Vec<ViolationEvent> = Vec::new();
        for record in &records {
            let config = enrichment.get(&record.identity).await;
            for calculator in &mut registry {
                for event in calculator.process(record, &config) {
                    if let CalcEvent::Violation(v) = event {
                        violations.push(v);
                    }
                }
            }
        }

        info!(
            job = job.id,
            records = records.len(),
            cleared,
            regenerated = violations.len(),
            "violations recomputed"
        );
        self.store.write_batch(&[], &violations).await
    }
}
