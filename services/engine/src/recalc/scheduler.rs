//! Scheduled view refresh: enqueue `refresh_all_views` at a configured
//! interval, after an initial delay that keeps a restart storm from
//! refreshing everything at once.

use crate::recalc::queue::JobStore;
use crate::recalc::{JobKind, JobScope, JobTrigger, NewJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run_scheduler(
    jobs: Arc<dyn JobStore>,
    interval: Duration,
    initial_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = shutdown.wait_for(|v| *v) => return,
        () = tokio::time::sleep(initial_delay) => {}
    }

    loop {
        let job = NewJob {
            kind: JobKind::RefreshAllViews,
            trigger: JobTrigger::Manual,
            priority: 5,
            reason: Some("scheduled".to_owned()),
            scope: JobScope::unbounded(),
        };
        match jobs.enqueue(job).await {
            Ok(id) => info!(job = id, "scheduled view refresh enqueued"),
            Err(e) => error!(error = %e, "scheduled refresh enqueue failed"),
        }

        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recalc::queue::MemoryJobStore;

    #[tokio::test]
    async fn enqueues_after_initial_delay() {
        let jobs = Arc::new(MemoryJobStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_scheduler(
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            Duration::from_secs(3600),
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(jobs.counts().0, 0, "nothing before the initial delay");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while jobs.counts().0 != 1 {
            assert!(tokio::time::Instant::now() < deadline, "refresh never enqueued");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
