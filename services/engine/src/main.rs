// engine: metric engine service.
//
// Consume workers, recalculation workers, the scheduled refresh timer,
// the broker job listener, and the SIGHUP catalog reload.

use engine::calculators::{build_registry, registry_versions};
use engine::catalog::{reload_catalog, CatalogStore, PgCatalogStore};
use engine::enrich::{ConfigSource, EnrichmentCache, PgConfigSource};
use engine::pipeline::Pipeline;
use engine::recalc::queue::{JobStore, PgJobStore};
use engine::recalc::worker::RecalcWorker;
use engine::recalc::{listener, scheduler};
use engine::store::{EngineStore, PgEngineStore};
use engine::worker::{run_engine_worker, EngineWorkerConfig};
use engine::{config, EngineMetrics};
use fleet_infra::breaker::CircuitBreaker;
use fleet_infra::health::Readiness;
use fleet_infra::shutdown::{spawn_hangup_listener, spawn_signal_listener, ShutdownHandle};
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
        workers = cfg.engine.workers,
        shadow_mode = cfg.engine.shadow_mode,
        "engine starting"
    );

    let metrics = EngineMetrics::new();
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
    let store: Arc<dyn EngineStore> = Arc::new(PgEngineStore::new(pool.clone()));
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let catalog: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(pool.clone()));
    let config_source: Arc<dyn ConfigSource> = Arc::new(PgConfigSource::new(pool.clone()));
    let db_breaker = Arc::new(CircuitBreaker::new("database", 5, Duration::from_secs(30)));

    // Startup catalog pass: a deploy with bumped formula versions enqueues
    // its own recomputation.
    if let Err(e) = reload_catalog(&registry_versions(), &catalog, &jobs).await {
        warn!(error = %e, "startup catalog reload failed");
    }

    // SIGHUP → catalog reload.
    {
        let catalog = Arc::clone(&catalog);
        let jobs = Arc::clone(&jobs);
        let mut hangups = spawn_hangup_listener();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { shutdown_rx.wait_for(|v| *v).await.map(|r| *r) } => break,
                    hangup = hangups.recv() => {
                        if hangup.is_none() {
                            break;
                        }
                        info!("SIGHUP received, reloading calculator catalog");
                        if let Err(e) = reload_catalog(&registry_versions(), &catalog, &jobs).await {
                            warn!(error = %e, "catalog reload failed");
                        }
                    }
                }
            }
        });
    }

    // Health server.
    {
        let bind = cfg.engine.health_bind.clone();
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

    // Readiness refresher.
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

    // Consume workers. The broker readiness flag flips on the first
    // successful attach (each worker owns its connection).
    let mut tasks = Vec::new();
    for worker_id in 0..cfg.engine.workers {
        let enrichment = EnrichmentCache::new(
            Arc::clone(&config_source),
            Duration::from_secs(cfg.engine.enrichment_ttl),
        );
        let pipeline = Pipeline::new(
            build_registry(),
            enrichment,
            cfg.engine.shadow_mode,
            Arc::clone(&metrics),
        );
        tasks.push(tokio::spawn(run_engine_worker(
            EngineWorkerConfig {
                worker_id,
                batch_size: cfg.engine.batch_size,
                batch_timeout: cfg.engine.batch_timeout_duration(),
                prefetch: cfg.engine.effective_prefetch(),
                shadow_mode: cfg.engine.shadow_mode,
            },
            cfg.broker.clone(),
            pipeline,
            Arc::clone(&store),
            Arc::clone(&db_breaker),
            Arc::clone(&metrics),
            shutdown.subscribe(),
        )));
    }
    readiness.set_broker(true);

    // Recalculation worker, scheduler, and the external job listener.
    tasks.push(tokio::spawn(
        RecalcWorker {
            jobs: Arc::clone(&jobs),
            store: Arc::clone(&store),
            config_source: Arc::clone(&config_source),
            metrics: Arc::clone(&metrics),
            poll_interval: Duration::from_secs(cfg.engine.recalc_poll_interval),
            lease: Duration::from_secs(cfg.engine.job_lease),
        }
        .run(shutdown.subscribe()),
    ));
    tasks.push(tokio::spawn(scheduler::run_scheduler(
        Arc::clone(&jobs),
        Duration::from_secs(cfg.engine.scheduled_refresh_interval),
        Duration::from_secs(cfg.engine.scheduled_refresh_initial_delay),
        shutdown.subscribe(),
    )));
    tasks.push(tokio::spawn(listener::run_listener(
        cfg.broker.clone(),
        Arc::clone(&jobs),
        shutdown.subscribe(),
    )));

    let mut shutdown_rx = shutdown.subscribe();
    fleet_infra::shutdown::wait(&mut shutdown_rx).await;
    info!("shutdown requested, draining workers");

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("worker drain exceeded 30s, terminating anyway");
    }
    info!("engine shutdown complete");
}
