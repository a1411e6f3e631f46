//! Command sender: drains the in-process send buffer and writes encoded
//! command packets on device sockets.

use crate::commands::strip_sms_credentials;
use crate::conn_table::ConnectionTable;
use crate::metrics::GatewayMetrics;
use fleet_proto::Identity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One command ready for encoding and dispatch.
#[derive(Debug)]
pub struct SendJob {
    pub identity: Identity,
    pub payload: String,
}

pub async fn run_sender(
    table: Arc<ConnectionTable>,
    metrics: Arc<GatewayMetrics>,
    mut jobs: mpsc::Receiver<SendJob>,
    inter_command_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_identity: Option<Identity> = None;

    loop {
        let job = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // Devices drop back-to-back packets; space consecutive commands to
        // the same unit.
        if last_identity.as_ref() == Some(&job.identity) {
            tokio::time::sleep(inter_command_delay).await;
        }

        let Some(writer) = table.lookup(&job.identity) else {
            // Device went offline after the poll; the sent row stays until
            // the sweep expires it to no_reply.
            info!(identity = %job.identity, "device offline, skipping command");
            continue;
        };

        let packet = fleet_codec::encode_command(strip_sms_credentials(&job.payload));
        match writer.write(packet).await {
            Ok(()) => {
                metrics.commands_sent_total.inc();
                debug!(identity = %job.identity, "command written to socket");
                last_identity = Some(job.identity);
            }
            Err(e) => {
                warn!(identity = %job.identity, error = %e, "command write failed");
                last_identity = None;
            }
        }
    }
}
