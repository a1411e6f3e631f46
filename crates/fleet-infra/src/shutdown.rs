//! Cooperative shutdown plumbing.
//!
//! One `ShutdownHandle` per process, created in `main`. Long-running tasks
//! subscribe and `select!` on the receiver; signal wiring translates
//! SIGINT/SIGTERM into the shutdown broadcast. SIGHUP is surfaced
//! separately for services that reload state on it.

use tokio::sync::watch;
use tracing::info;

/// Broadcast handle for the process-wide shutdown signal.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        ShutdownHandle { tx }
    }

    /// Subscribe; the receiver resolves `wait_for(|v| *v)` once shutdown
    /// has been requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        ShutdownHandle::new()
    }
}

/// Await a shutdown request on a subscribed receiver.
pub async fn wait(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

/// Translate SIGINT/SIGTERM into the shutdown broadcast. Runs until the
/// first signal arrives.
#[cfg(unix)]
pub fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
        handle.trigger();
    });
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            handle.trigger();
        }
    });
}

/// Surface SIGHUP deliveries on a channel (the engine reloads its
/// calculator catalog on hang-up). No-op stream on non-unix targets.
#[cfg(unix)]
pub fn spawn_hangup_listener() -> tokio::sync::mpsc::Receiver<()> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(not(unix))]
pub fn spawn_hangup_listener() -> tokio::sync::mpsc::Receiver<()> {
    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_subscribers() {
        let handle = ShutdownHandle::new();
        let mut rx = handle.subscribe();
        assert!(!handle.is_triggered());

        let waiter = tokio::spawn(async move {
            wait(&mut rx).await;
        });
        handle.trigger();
        waiter.await.unwrap();
        assert!(handle.is_triggered());
    }

    #[tokio::test]
    async fn late_subscriber_sees_triggered_state() {
        let handle = ShutdownHandle::new();
        handle.trigger();
        let mut rx = handle.subscribe();
        // Must resolve immediately even though the send happened first.
        wait(&mut rx).await;
    }
}
