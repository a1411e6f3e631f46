//! Response correlator: matches device responses to outstanding commands.
//!
//! Matching is by "most recent `sent` row for this identity and method".
//! With multiple commands in flight to one device this is ambiguous (the
//! wire format carries no correlation id), but socket responses arrive
//! within moments of the command, so in practice the newest sent row is
//! the right one. Unmatched responses are legitimate (devices send
//! unsolicited messages) and are recorded, never treated as errors.

use crate::commands::store::{CommandStore, DeliveryMethod};
use crate::metrics::GatewayMetrics;
use fleet_proto::Identity;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// A command response forwarded from a session's read loop.
#[derive(Debug)]
pub struct ResponseEvent {
    pub identity: Identity,
    pub text: String,
}

pub async fn run_correlator(
    store: Arc<dyn CommandStore>,
    metrics: Arc<GatewayMetrics>,
    mut responses: mpsc::Receiver<ResponseEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            event = responses.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match store
            .complete_reply(&event.identity, DeliveryMethod::Gprs, &event.text)
            .await
        {
            Ok(true) => {
                metrics.responses_matched_total.inc();
                debug!(identity = %event.identity, "response matched to sent command");
            }
            Ok(false) => {
                metrics.responses_unmatched_total.inc();
                debug!(identity = %event.identity, "unsolicited response recorded");
                if let Err(e) = store
                    .record_unmatched(&event.identity, DeliveryMethod::Gprs, &event.text)
                    .await
                {
                    error!(identity = %event.identity, error = %e, "recording unmatched response failed");
                }
            }
            Err(e) => {
                error!(identity = %event.identity, error = %e, "response correlation failed");
            }
        }
    }
}
