//! TCP accept loop.
//!
//! One task; each accepted connection gets its own session task. A
//! semaphore caps concurrent connections: at the cap, new sockets are
//! dropped immediately rather than queued.

use crate::session::{run_session, SessionCtx};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// Bind with an explicit listen backlog.
pub fn bind(addr: &str, backlog: u32) -> std::io::Result<TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

pub async fn run_listener(
    listener: TcpListener,
    ctx: SessionCtx,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_connections));
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        max_connections,
        "gateway listening"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            warn!(addr = %peer, "connection limit reached, dropping socket");
            continue;
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_session(stream, peer, ctx).await;
            drop(permit);
        });
    }
    info!("listener stopped accepting connections");
}
