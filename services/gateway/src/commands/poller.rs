//! Outbox poller: moves due commands from the database to the in-process
//! send buffer.
//!
//! One poller runs per delivery method handled by this gateway. Each cycle
//! reads the connected-identity set from the connection table, fetches
//! matching outbox rows oldest-first, and for each row performs the
//! transactional outbox → sent move before queueing it for the sender. A
//! row that fails the move stays in the outbox for the next poll.

use crate::commands::sender::SendJob;
use crate::commands::store::{CommandStore, DeliveryMethod};
use crate::conn_table::ConnectionTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

pub struct PollerConfig {
    pub method: DeliveryMethod,
    pub interval: Duration,
    pub batch_size: i64,
}

pub async fn run_poller(
    cfg: PollerConfig,
    table: Arc<ConnectionTable>,
    store: Arc<dyn CommandStore>,
    send_tx: mpsc::Sender<SendJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            _ = ticker.tick() => {}
        }

        let connected = table.connected_identities();
        if connected.is_empty() {
            continue;
        }

        let commands = match store
            .fetch_outbox(cfg.method, &connected, cfg.batch_size)
            .await
        {
            Ok(commands) => commands,
            Err(e) => {
                error!(error = %e, "outbox poll failed");
                continue;
            }
        };
        if commands.is_empty() {
            continue;
        }
        debug!(
            count = commands.len(),
            connected = connected.len(),
            "polled outbox commands"
        );

        for command in commands {
            // Move to sent BEFORE queueing, so the command is tracked even
            // if we crash between here and the socket write; the sweep then
            // closes it out as no_reply.
            match store.mark_sent(&command).await {
                Ok(true) => {
                    let job = SendJob {
                        identity: command.identity.clone(),
                        payload: command.payload.clone(),
                    };
                    if send_tx.send(job).await.is_err() {
                        return; // sender gone, shutting down
                    }
                }
                Ok(false) => {
                    debug!(id = command.id, "outbox row already taken");
                }
                Err(e) => {
                    warn!(id = command.id, error = %e, "outbox move failed, row stays queued");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::store::MemoryCommandStore;
    use crate::conn_table::spawn_writer;
    use crate::metrics::GatewayMetrics;
    use fleet_proto::Identity;

    async fn connected_table(identity: &Identity) -> Arc<ConnectionTable> {
        // Register over a real socket pair so the writer handle is live.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();

        let table = ConnectionTable::new(16, GatewayMetrics::new());
        table
            .register(identity.clone(), spawn_writer(write), peer)
            .unwrap();
        table
    }

    #[tokio::test]
    async fn polls_only_connected_identities() {
        let online: Identity = "123456789012345".parse().unwrap();
        let offline: Identity = "999999999999999".parse().unwrap();
        let table = connected_table(&online).await;

        let store = Arc::new(MemoryCommandStore::new());
        store.insert_outbox(&online, DeliveryMethod::Gprs, "getinfo");
        store.insert_outbox(&offline, DeliveryMethod::Gprs, "getinfo");

        let (send_tx, mut send_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(run_poller(
            PollerConfig {
                method: DeliveryMethod::Gprs,
                interval: Duration::from_millis(10),
                batch_size: 10,
            },
            table,
            Arc::clone(&store) as Arc<dyn CommandStore>,
            send_tx,
            shutdown_rx,
        ));

        let job = tokio::time::timeout(Duration::from_secs(2), send_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.identity, online);
        assert_eq!(job.payload, "getinfo");

        // The offline device's row is untouched.
        assert_eq!(store.outbox_len(), 1);
        assert_eq!(store.sent_len(), 1);

        shutdown_tx.send(true).unwrap();
        poller.await.unwrap();
    }
}
