//! Command timeout sweep.
//!
//! Once a minute: outbox rows older than the outbox timeout move to
//! history as `failed` (never picked up: device offline the whole time);
//! sent rows with no reply past the reply timeout become `no_reply`. This
//! closes the command lifecycle for every row that will never complete.

use crate::commands::store::CommandStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct SweepConfig {
    pub interval: Duration,
    pub outbox_timeout: Duration,
    pub reply_timeout: Duration,
}

pub async fn run_sweep(
    cfg: SweepConfig,
    store: Arc<dyn CommandStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            _ = ticker.tick() => {}
        }

        let outbox_cutoff = Utc::now()
            - chrono::Duration::from_std(cfg.outbox_timeout).unwrap_or(chrono::Duration::zero());
        match store.expire_outbox(outbox_cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "expired stale outbox commands to failed"),
            Err(e) => error!(error = %e, "outbox expiry failed"),
        }

        let sent_cutoff = Utc::now()
            - chrono::Duration::from_std(cfg.reply_timeout).unwrap_or(chrono::Duration::zero());
        match store.expire_sent(sent_cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "expired unanswered commands to no_reply"),
            Err(e) => error!(error = %e, "sent expiry failed"),
        }
    }
}
