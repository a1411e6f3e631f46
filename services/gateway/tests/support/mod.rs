//! In-process gateway harness for integration tests: real TCP listener,
//! memory-backed broker and command store.

use fleet_infra::broker::{BrokerPublisher, MemoryBroker};
use fleet_infra::shutdown::ShutdownHandle;
use gateway::commands::poller::{run_poller, PollerConfig};
use gateway::commands::sweep::{run_sweep, SweepConfig};
use gateway::commands::{correlator, sender, CommandStore, DeliveryMethod, MemoryCommandStore};
use gateway::session::SessionCtx;
use gateway::{listener, publisher, ConnectionTable, GatewayMetrics};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryCommandStore>,
    pub table: Arc<ConnectionTable>,
    pub metrics: Arc<GatewayMetrics>,
    pub shutdown: ShutdownHandle,
}

pub struct GatewayOptions {
    pub staging_buffer: usize,
    pub reply_timeout: Duration,
    pub outbox_timeout: Duration,
    pub run_sweep: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        GatewayOptions {
            staging_buffer: 1024,
            reply_timeout: Duration::from_secs(120),
            outbox_timeout: Duration::from_secs(60),
            run_sweep: false,
        }
    }
}

pub async fn start_gateway(options: GatewayOptions) -> TestGateway {
    let metrics = GatewayMetrics::new();
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryCommandStore::new());
    let table = ConnectionTable::new(64, Arc::clone(&metrics));
    let shutdown = ShutdownHandle::new();

    let breaker = Arc::new(fleet_infra::breaker::CircuitBreaker::new(
        "broker",
        3,
        Duration::from_millis(500),
    ));
    let (records_tx, _publisher_task) = publisher::spawn_publisher(
        Arc::clone(&broker) as Arc<dyn BrokerPublisher>,
        Arc::clone(&metrics),
        options.staging_buffer,
        breaker,
        shutdown.subscribe(),
    );

    let (send_tx, send_rx) = tokio::sync::mpsc::channel(64);
    let (responses_tx, responses_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(run_poller(
        PollerConfig {
            method: DeliveryMethod::Gprs,
            interval: Duration::from_millis(50),
            batch_size: 10,
        },
        Arc::clone(&table),
        Arc::clone(&store) as Arc<dyn CommandStore>,
        send_tx,
        shutdown.subscribe(),
    ));
    tokio::spawn(sender::run_sender(
        Arc::clone(&table),
        Arc::clone(&metrics),
        send_rx,
        Duration::from_millis(10),
        shutdown.subscribe(),
    ));
    tokio::spawn(correlator::run_correlator(
        Arc::clone(&store) as Arc<dyn CommandStore>,
        Arc::clone(&metrics),
        responses_rx,
        shutdown.subscribe(),
    ));
    if options.run_sweep {
        tokio::spawn(run_sweep(
            SweepConfig {
                interval: Duration::from_millis(50),
                outbox_timeout: options.outbox_timeout,
                reply_timeout: options.reply_timeout,
            },
            Arc::clone(&store) as Arc<dyn CommandStore>,
            shutdown.subscribe(),
        ));
    }

    let tcp = listener::bind("127.0.0.1:0", 64).expect("bind test listener");
    let addr = tcp.local_addr().expect("local addr");
    let ctx = SessionCtx {
        table: Arc::clone(&table),
        records_tx,
        responses_tx,
        metrics: Arc::clone(&metrics),
        idle_timeout: Duration::from_secs(5),
        device_utc_offset_minutes: 0,
    };
    tokio::spawn(listener::run_listener(tcp, ctx, 64, shutdown.subscribe()));

    TestGateway {
        addr,
        broker,
        store,
        table,
        metrics,
        shutdown,
    }
}

/// Connect and complete the handshake, asserting acceptance.
pub async fn connect_device(addr: SocketAddr, identity: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(&fleet_codec::testkit::handshake(identity))
        .await
        .expect("send handshake");
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await.expect("handshake reply");
    assert_eq!(reply[0], 0x01, "handshake accepted");
    stream
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) {
    let start = tokio::time::Instant::now();
    while !predicate() {
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const IDENTITY: &str = "123456789012345";
