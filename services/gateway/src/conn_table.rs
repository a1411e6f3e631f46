//! Connection table: the single source of truth for which devices are
//! currently reachable through this gateway instance.
//!
//! A bounded map from identity to connection record behind one std mutex.
//! Every operation is a short critical section; nothing suspends while the
//! lock is held. Closing a connection is a synchronous `watch` send (the
//! kick signal), so replacement inside `register` needs no await either.

use crate::metrics::GatewayMetrics;
use fleet_proto::Identity;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("connection table full ({0} entries)")]
    Full(usize),
}

#[derive(Debug, Error)]
#[error("connection writer closed")]
pub struct WriterClosed;

/// Connection lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitingHandshake,
    Authenticated,
    Streaming,
    Closing,
}

// ---------------------------------------------------------------------------
// ConnectionWriter
// ---------------------------------------------------------------------------

/// Handle to a connection's single serialised writer task.
///
/// Cloneable; writes go through a bounded channel to the task that owns the
/// socket's write half. `kick` asks the task to shut the socket down.
#[derive(Debug, Clone)]
pub struct ConnectionWriter {
    data_tx: mpsc::Sender<Vec<u8>>,
    kick_tx: watch::Sender<bool>,
}

impl ConnectionWriter {
    /// Queue bytes for the socket. Blocks (cooperatively) when the writer
    /// is backed up.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), WriterClosed> {
        self.data_tx.send(bytes).await.map_err(|_| WriterClosed)
    }

    /// Ask the writer task to drain and close the socket. Synchronous, so
    /// it is safe to call with the table lock held.
    pub fn kick(&self) {
        let _ = self.kick_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.data_tx.is_closed()
    }

    /// Receiver for the kick signal; the session read loop selects on it.
    pub fn kicked(&self) -> watch::Receiver<bool> {
        self.kick_tx.subscribe()
    }
}

/// Spawn the writer task owning a socket write half; returns the handle.
pub fn spawn_writer(mut write_half: OwnedWriteHalf) -> ConnectionWriter {
    let (data_tx, mut data_rx) = mpsc::channel::<Vec<u8>>(64);
    let (kick_tx, mut kick_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = kick_rx.changed() => {
                    if changed.is_err() || *kick_rx.borrow() {
                        // Flush bytes already queued (e.g. a handshake
                        // reject) before closing the socket.
                        while let Ok(bytes) = data_rx.try_recv() {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
                bytes = data_rx.recv() => {
                    match bytes {
                        Some(bytes) => {
                            if let Err(e) = write_half.write_all(&bytes).await {
                                debug!(error = %e, "socket write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    });

    ConnectionWriter { data_tx, kick_tx }
}

// ---------------------------------------------------------------------------
// ConnectionTable
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ConnectionRecord {
    writer: ConnectionWriter,
    remote_addr: SocketAddr,
    created_at: Instant,
    last_activity: Instant,
    state: ConnState,
}

/// Bounded identity → connection index. At most one entry per identity;
/// registering a duplicate closes the previous connection first.
pub struct ConnectionTable {
    inner: Mutex<HashMap<Identity, ConnectionRecord>>,
    capacity: usize,
    metrics: Arc<GatewayMetrics>,
    total_disconnections: AtomicU64,
}

impl ConnectionTable {
    pub fn new(capacity: usize, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        Arc::new(ConnectionTable {
            inner: Mutex::new(HashMap::new()),
            capacity,
            metrics,
            total_disconnections: AtomicU64::new(0),
        })
    }

    /// Insert-or-replace for an authenticated connection. The previous
    /// writer, if any, is kicked before the new record is visible.
    pub fn register(
        &self,
        identity: Identity,
        writer: ConnectionWriter,
        remote_addr: SocketAddr,
    ) -> Result<(), TableError> {
        let mut inner = self.inner.lock().expect("connection table mutex poisoned");
        if inner.len() >= self.capacity && !inner.contains_key(&identity) {
            return Err(TableError::Full(self.capacity));
        }

        let now = Instant::now();
        if let Some(old) = inner.insert(
            identity.clone(),
            ConnectionRecord {
                writer,
                remote_addr,
                created_at: now,
                last_activity: now,
                state: ConnState::Authenticated,
            },
        ) {
            info!(identity = %identity, old_addr = %old.remote_addr, "duplicate handshake, closing previous connection");
            old.writer.kick();
        }
        drop(inner);

        self.metrics.connections_total.inc();
        self.metrics
            .connections_current
            .set(self.len() as i64);
        Ok(())
    }

    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionWriter> {
        self.inner
            .lock()
            .expect("connection table mutex poisoned")
            .get(identity)
            .map(|r| r.writer.clone())
    }

    /// Update last-activity for an identity.
    pub fn touch(&self, identity: &Identity) {
        if let Some(record) = self
            .inner
            .lock()
            .expect("connection table mutex poisoned")
            .get_mut(identity)
        {
            record.last_activity = Instant::now();
        }
    }

    pub fn set_state(&self, identity: &Identity, state: ConnState) {
        if let Some(record) = self
            .inner
            .lock()
            .expect("connection table mutex poisoned")
            .get_mut(identity)
        {
            record.state = state;
        }
    }

    /// Remove the entry for `identity`, but only if it still belongs to the
    /// caller's connection. A replaced session calling `remove` on its way
    /// out must not evict its replacement.
    pub fn remove(&self, identity: &Identity, remote_addr: SocketAddr) {
        let removed = {
            let mut inner = self.inner.lock().expect("connection table mutex poisoned");
            match inner.get(identity) {
                Some(record) if record.remote_addr == remote_addr => {
                    inner.remove(identity);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.total_disconnections.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .connections_current
                .set(self.len() as i64);
            debug!(identity = %identity, addr = %remote_addr, "connection removed");
        }
    }

    /// Kick and drop entries idle longer than `max_idle`. Returns how many
    /// were evicted.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let stale: Vec<(Identity, ConnectionWriter)> = {
            let mut inner = self.inner.lock().expect("connection table mutex poisoned");
            let cutoff = Instant::now();
            let stale_keys: Vec<Identity> = inner
                .iter()
                .filter(|(_, r)| cutoff.duration_since(r.last_activity) > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|id| inner.remove(&id).map(|r| (id, r.writer)))
                .collect()
        };

        for (identity, writer) in &stale {
            warn!(identity = %identity, "closing idle connection");
            writer.kick();
        }
        let evicted = stale.len();
        if evicted > 0 {
            self.total_disconnections
                .fetch_add(evicted as u64, Ordering::Relaxed);
            self.metrics
                .disconnections_total
                .with_label_values(&["idle"])
                .inc_by(evicted as u64);
            self.metrics
                .connections_current
                .set(self.len() as i64);
        }
        evicted
    }

    /// Shutdown hook: kick every connection and clear the table.
    pub fn close_all(&self) {
        let drained: Vec<ConnectionWriter> = {
            let mut inner = self.inner.lock().expect("connection table mutex poisoned");
            inner.drain().map(|(_, r)| r.writer).collect()
        };
        info!(count = drained.len(), "closing all connections");
        for writer in drained {
            writer.kick();
        }
        self.metrics.connections_current.set(0);
    }

    /// Identities currently connected; the command poller filters its
    /// outbox query by this set.
    pub fn connected_identities(&self) -> Vec<Identity> {
        self.inner
            .lock()
            .expect("connection table mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("connection table mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn uptime_of(&self, identity: &Identity) -> Option<Duration> {
        self.inner
            .lock()
            .expect("connection table mutex poisoned")
            .get(identity)
            .map(|r| r.created_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_pair() -> (ConnectionWriter, mpsc::Receiver<Vec<u8>>, watch::Receiver<bool>) {
        // A writer backed by channels instead of a socket, for table tests.
        let (data_tx, data_rx) = mpsc::channel(8);
        let (kick_tx, kick_rx) = watch::channel(false);
        (ConnectionWriter { data_tx, kick_tx }, data_rx, kick_rx)
    }

    fn identity(n: u64) -> Identity {
        format!("{n:015}").parse().unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn table(capacity: usize) -> Arc<ConnectionTable> {
        ConnectionTable::new(capacity, GatewayMetrics::new())
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let table = table(10);
        let (writer, _rx, _kick) = writer_pair();
        table.register(identity(1), writer, addr(1000)).unwrap();
        assert!(table.lookup(&identity(1)).is_some());
        assert!(table.lookup(&identity(2)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_register_kicks_old_writer() {
        let table = table(10);
        let (old_writer, _old_rx, mut old_kick) = writer_pair();
        let (new_writer, _new_rx, _new_kick) = writer_pair();

        table.register(identity(1), old_writer, addr(1000)).unwrap();
        table.register(identity(1), new_writer, addr(2000)).unwrap();

        assert_eq!(table.len(), 1);
        old_kick.changed().await.unwrap();
        assert!(*old_kick.borrow());
    }

    #[tokio::test]
    async fn remove_ignores_stale_address() {
        let table = table(10);
        let (old_writer, _o, _ok) = writer_pair();
        let (new_writer, _n, _nk) = writer_pair();
        table.register(identity(1), old_writer, addr(1000)).unwrap();
        table.register(identity(1), new_writer, addr(2000)).unwrap();

        // The replaced session cleans up with its own (stale) address;
        // the replacement must survive.
        table.remove(&identity(1), addr(1000));
        assert_eq!(table.len(), 1);

        table.remove(&identity(1), addr(2000));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let table = table(1);
        let (w1, _r1, _k1) = writer_pair();
        let (w2, _r2, _k2) = writer_pair();
        table.register(identity(1), w1, addr(1000)).unwrap();
        assert!(matches!(
            table.register(identity(2), w2, addr(2000)),
            Err(TableError::Full(1))
        ));
        // Replacing an existing identity is allowed at capacity.
        let (w3, _r3, _k3) = writer_pair();
        table.register(identity(1), w3, addr(3000)).unwrap();
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle() {
        let table = table(10);
        let (w1, _r1, mut k1) = writer_pair();
        let (w2, _r2, _k2) = writer_pair();
        table.register(identity(1), w1, addr(1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        table.register(identity(2), w2, addr(2000)).unwrap();

        let evicted = table.sweep(Duration::from_millis(15));
        assert_eq!(evicted, 1);
        assert!(table.lookup(&identity(1)).is_none());
        assert!(table.lookup(&identity(2)).is_some());
        k1.changed().await.unwrap();
    }

    #[tokio::test]
    async fn touch_defers_sweep() {
        let table = table(10);
        let (w1, _r1, _k1) = writer_pair();
        table.register(identity(1), w1, addr(1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        table.touch(&identity(1));
        assert_eq!(table.sweep(Duration::from_millis(15)), 0);
    }

    #[tokio::test]
    async fn close_all_empties_table() {
        let table = table(10);
        let (w1, _r1, mut k1) = writer_pair();
        let (w2, _r2, mut k2) = writer_pair();
        table.register(identity(1), w1, addr(1000)).unwrap();
        table.register(identity(2), w2, addr(2000)).unwrap();
        table.close_all();
        assert!(table.is_empty());
        k1.changed().await.unwrap();
        k2.changed().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_duplicate_handshakes_leave_one_entry() {
        // Interleave many registrations for the same identity from
        // concurrent tasks; the table must never hold more than one entry.
        let table = table(100);
        let mut handles = Vec::new();
        for i in 0..32u16 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let (w, _r, _k) = writer_pair();
                table.register(identity(7), w, addr(1000 + i)).unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(table.len(), 1);
    }
}
