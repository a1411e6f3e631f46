// consumer: persistence service.
//
// One set of workers per queue; each worker owns its broker channel and a
// batch processor. Readiness reflects DB and broker health.

use consumer::store::{PgTelemetryStore, TelemetryStore};
use consumer::worker::{run_worker, BatchProcessor, WorkerConfig};
use consumer::{config, ConsumerMetrics, QueueKind};
use fleet_infra::breaker::CircuitBreaker;
use fleet_infra::health::Readiness;
use fleet_infra::shutdown::{spawn_signal_listener, ShutdownHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = fleet_infra::config::config_path();
    let cfg = match config::load_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };
    fleet_infra::config::init_tracing(&cfg.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cfg.consumer.workers,
        batch_size = cfg.consumer.batch_size,
        "consumer starting"
    );

    let metrics = ConsumerMetrics::new();
    let readiness = Readiness::new();
    let ready_gauge = readiness.register_gauge(&metrics.registry);
    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone());

    let pool = match fleet_infra::db::create_pool(&cfg.database).await {
        Ok(pool) => {
            readiness.set_db(true);
            pool
        }
        Err(e) => {
            error!(error = %e, "database not reachable at startup");
            std::process::exit(1);
        }
    };
    let store: Arc<dyn TelemetryStore> = Arc::new(PgTelemetryStore::new(pool.clone()));
    let db_breaker = Arc::new(CircuitBreaker::new("database", 5, Duration::from_secs(30)));

    // Health server.
    {
        let bind = cfg.consumer.health_bind.clone();
        let readiness = readiness.clone();
        let registry = Arc::clone(&metrics.registry);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = fleet_infra::health::serve(&bind, readiness, registry, shutdown_rx).await
            {
                error!(error = %e, "health server failed");
            }
        });
    }

    // Readiness refresher and breaker gauge.
    {
        let readiness = readiness.clone();
        let pool = pool.clone();
        let breaker = Arc::clone(&db_breaker);
        let metrics = Arc::clone(&metrics);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|v| *v) => break,
                    _ = ticker.tick() => {}
                }
                let db_up = fleet_infra::db::ping(&pool).await;
                readiness.set_db(db_up && breaker.state() != fleet_infra::BreakerState::Open);
                metrics
                    .breaker_state
                    .with_label_values(&["database"])
                    .set(breaker.state().code());
                ready_gauge.set(i64::from(readiness.is_ready()));
            }
        });
    }

    // Workers: per queue, per worker index.
    let mut worker_tasks = Vec::new();
    for queue in QueueKind::ALL {
        for worker_id in 0..cfg.consumer.workers {
            let processor = BatchProcessor::new(
                queue,
                Arc::clone(&store),
                cfg.consumer.dedup_capacity,
                Arc::clone(&metrics),
            );
            let worker_cfg = WorkerConfig {
                queue,
                worker_id,
                batch_size: cfg.consumer.batch_size,
                batch_timeout: cfg.consumer.batch_timeout_duration(),
                prefetch: cfg.consumer.effective_prefetch(),
            };
            worker_tasks.push(tokio::spawn(run_worker(
                worker_cfg,
                cfg.broker.clone(),
                processor,
                Arc::clone(&db_breaker),
                shutdown.subscribe(),
            )));
        }
    }
    // Connection gauge doubles as broker readiness: any attached worker
    // counts.
    {
        let readiness = readiness.clone();
        let metrics = Arc::clone(&metrics);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|v| *v) => break,
                    _ = ticker.tick() => {}
                }
                let attached = QueueKind::ALL.iter().any(|q| {
                    metrics
                        .connection_connected
                        .with_label_values(&[q.queue_name()])
                        .get()
                        > 0
                });
                readiness.set_broker(attached);
            }
        });
    }

    let mut shutdown_rx = shutdown.subscribe();
    fleet_infra::shutdown::wait(&mut shutdown_rx).await;
    info!("shutdown requested, flushing in-flight batches");

    // Bounded wait for workers to flush and stop; past that, termination
    // wins and the broker redelivers whatever was unacked.
    let drain = async {
        for task in worker_tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("worker drain exceeded 30s, terminating anyway");
    }
    info!("consumer shutdown complete");
}
