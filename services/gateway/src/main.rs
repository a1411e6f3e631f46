// gateway: device ingest service.
//
// Wires together the connection table, listener, publisher, command path,
// and health server, then supervises the shutdown sequence.

use fleet_infra::broker::{BrokerPublisher, LapinBroker};
use fleet_infra::health::Readiness;
use fleet_infra::shutdown::{spawn_signal_listener, ShutdownHandle};
use gateway::commands::poller::{run_poller, PollerConfig};
use gateway::commands::sweep::{run_sweep, SweepConfig};
use gateway::commands::{correlator, sender, CommandStore, DeliveryMethod, PgCommandStore};
use gateway::session::SessionCtx;
use gateway::{config, listener, publisher, ConnectionTable, GatewayMetrics};
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
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let metrics = GatewayMetrics::new();
    let readiness = Readiness::new();
    let ready_gauge = readiness.register_gauge(&metrics.registry);
    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone());

    // Broker: connect eagerly so the readiness flag reflects reality, but
    // keep running on failure; the publisher reconnects with backoff.
    let broker = Arc::new(LapinBroker::new(cfg.broker.clone()));
    match broker.connect().await {
        Ok(()) => readiness.set_broker(true),
        Err(e) => warn!(error = %e, "broker not reachable at startup, will retry"),
    }

    // Database: the command path needs it; ingest itself does not.
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
    let store: Arc<dyn CommandStore> = Arc::new(PgCommandStore::new(pool.clone()));

    let table = ConnectionTable::new(cfg.gateway.max_concurrent_connections, Arc::clone(&metrics));

    // Publisher task with the bounded staging buffer and broker breaker.
    let broker_breaker = Arc::new(fleet_infra::breaker::CircuitBreaker::new(
        "broker",
        5,
        Duration::from_secs(30),
    ));
    let (records_tx, publisher_task) = publisher::spawn_publisher(
        Arc::clone(&broker) as Arc<dyn BrokerPublisher>,
        Arc::clone(&metrics),
        cfg.gateway.staging_buffer,
        broker_breaker,
        shutdown.subscribe(),
    );

    // Command path: poller → send buffer → sender; responses → correlator.
    let (send_tx, send_rx) = tokio::sync::mpsc::channel(1024);
    let (responses_tx, responses_rx) = tokio::sync::mpsc::channel(1024);
    tokio::spawn(run_poller(
        PollerConfig {
            method: DeliveryMethod::Gprs,
            interval: cfg.gateway.command_poll_interval,
            batch_size: cfg.gateway.command_batch_size,
        },
        Arc::clone(&table),
        Arc::clone(&store),
        send_tx,
        shutdown.subscribe(),
    ));
    tokio::spawn(sender::run_sender(
        Arc::clone(&table),
        Arc::clone(&metrics),
        send_rx,
        cfg.gateway.inter_command_delay,
        shutdown.subscribe(),
    ));
    tokio::spawn(correlator::run_correlator(
        Arc::clone(&store),
        Arc::clone(&metrics),
        responses_rx,
        shutdown.subscribe(),
    ));
    tokio::spawn(run_sweep(
        SweepConfig {
            interval: Duration::from_secs(60),
            outbox_timeout: cfg.gateway.outbox_timeout,
            reply_timeout: cfg.gateway.reply_timeout,
        },
        Arc::clone(&store),
        shutdown.subscribe(),
    ));

    // Idle-connection sweep and readiness refresh.
    {
        let table = Arc::clone(&table);
        let idle = cfg.gateway.idle_timeout;
        let interval = cfg.gateway.sweep_interval;
        let readiness = readiness.clone();
        let broker = Arc::clone(&broker);
        let pool = pool.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|v| *v) => break,
                    _ = ticker.tick() => {}
                }
                table.sweep(idle);
                readiness.set_broker(broker.is_connected());
                readiness.set_db(fleet_infra::db::ping(&pool).await);
                ready_gauge.set(i64::from(readiness.is_ready()));
            }
        });
    }

    // Health server.
    {
        let bind = cfg.gateway.health_bind.clone();
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

    // Listener.
    let tcp = match listener::bind(&cfg.gateway.listen_addr(), cfg.gateway.listen_backlog) {
        Ok(tcp) => tcp,
        Err(e) => {
            error!(addr = %cfg.gateway.listen_addr(), error = %e, "cannot bind ingest port");
            std::process::exit(1);
        }
    };
    let ctx = SessionCtx {
        table: Arc::clone(&table),
        records_tx,
        responses_tx,
        metrics: Arc::clone(&metrics),
        idle_timeout: cfg.gateway.idle_timeout,
        device_utc_offset_minutes: cfg.gateway.device_utc_offset_minutes,
    };
    let listener_task = tokio::spawn(listener::run_listener(
        tcp,
        ctx,
        cfg.gateway.max_concurrent_connections,
        shutdown.subscribe(),
    ));

    // Wait for shutdown, then run the ordered teardown: stop accepting,
    // bounded wait for in-flight frames, close connections, drain staging.
    let mut shutdown_rx = shutdown.subscribe();
    fleet_infra::shutdown::wait(&mut shutdown_rx).await;
    info!("shutdown requested, stopping listener");
    let _ = listener_task.await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    table.close_all();

    match tokio::time::timeout(Duration::from_secs(30), publisher_task).await {
        Ok(_) => info!("staging buffer drained"),
        Err(_) => warn!("staging buffer drain exceeded 30s, terminating anyway"),
    }
    info!("gateway shutdown complete");
}
