//! Command persistence: outbox, sent, and history tables.
//!
//! [`CommandStore`] is the capability boundary; [`PgCommandStore`] is the
//! production implementation, [`MemoryCommandStore`] backs the tests.
//!
//! Lifecycle: `outbox → sent → (successful | no_reply | failed)`, with a
//! history row archived at every transition. All multi-row moves happen in
//! a single transaction so a crash leaves the row in the outbox for the
//! next poll.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_proto::Identity;
use sqlx::{PgPool, Row};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

/// Closed enumeration of command delivery methods. The gateway polls only
/// `gprs`; `sms` rows are drained by the external modem driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Gprs,
    Sms,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMethod::Gprs => "gprs",
            DeliveryMethod::Sms => "sms",
        }
    }
}

/// One row from `command_outbox`.
#[derive(Debug, Clone)]
pub struct OutboxCommand {
    pub id: i64,
    pub identity: Identity,
    pub method: DeliveryMethod,
    pub payload: String,
    pub config_id: Option<i64>,
    pub user_id: Option<i64>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Outbox rows for the given method whose identity is currently
    /// connected, oldest first.
    async fn fetch_outbox(
        &self,
        method: DeliveryMethod,
        connected: &[Identity],
        limit: i64,
    ) -> Result<Vec<OutboxCommand>, StoreError>;

    /// Move one command out of the outbox: insert a `sent` row and an
    /// `outgoing/sent` history row, delete the outbox row, atomically.
    /// Returns false when another poller already took the row.
    async fn mark_sent(&self, command: &OutboxCommand) -> Result<bool, StoreError>;

    /// Match a device response against the most recent `sent` row for the
    /// identity and method: delete it, flip the outgoing history row to
    /// `successful`, insert an incoming history row. Returns false when no
    /// sent row matched.
    async fn complete_reply(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<bool, StoreError>;

    /// Record an unsolicited response as incoming `received` history.
    async fn record_unmatched(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<(), StoreError>;

    /// Expire outbox rows older than the cutoff into history as `failed`.
    async fn expire_outbox(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Expire `sent` rows with no reply older than the cutoff into history
    /// as `no_reply`.
    async fn expire_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    pub fn new(pool: PgPool) -> Self {
        PgCommandStore { pool }
    }
}

fn parse_method(s: &str) -> DeliveryMethod {
    match s {
        "sms" => DeliveryMethod::Sms,
        _ => DeliveryMethod::Gprs,
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn fetch_outbox(
        &self,
        method: DeliveryMethod,
        connected: &[Identity],
        limit: i64,
    ) -> Result<Vec<OutboxCommand>, StoreError> {
        let identities: Vec<String> =
            connected.iter().map(|i| i.as_str().to_owned()).collect();
        let rows = sqlx::query(
            r"SELECT id, identity, method, payload, config_id, user_id, retry_count, created_at
              FROM command_outbox
              WHERE method = $1 AND identity = ANY($2)
              ORDER BY created_at ASC
              LIMIT $3",
        )
        .bind(method.as_str())
        .bind(&identities)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut commands = Vec::with_capacity(rows.len());
        for row in rows {
            let identity: String = row.try_get("identity")?;
            let Ok(identity) = identity.parse::<Identity>() else {
                // A malformed identity can only come from a bad manual
                // insert; skip it rather than wedge the poller.
                tracing::warn!(identity, "skipping outbox row with invalid identity");
                continue;
            };
            let method: String = row.try_get("method")?;
            commands.push(OutboxCommand {
                id: row.try_get("id")?,
                identity,
                method: parse_method(&method),
                payload: row.try_get("payload")?,
                config_id: row.try_get("config_id")?,
                user_id: row.try_get("user_id")?,
                retry_count: row.try_get("retry_count")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(commands)
    }

    async fn mark_sent(&self, command: &OutboxCommand) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM command_outbox WHERE id = $1")
            .bind(command.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r"INSERT INTO command_sent
                  (identity, method, payload, status, created_at, sent_at)
              VALUES ($1, $2, $3, 'sent', $4, NOW())",
        )
        .bind(command.identity.as_str())
        .bind(command.method.as_str())
        .bind(&command.payload)
        .bind(command.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO command_history
                  (identity, direction, payload, status, method, created_at, sent_at)
              VALUES ($1, 'outgoing', $2, 'sent', $3, $4, NOW())",
        )
        .bind(command.identity.as_str())
        .bind(&command.payload)
        .bind(command.method.as_str())
        .bind(command.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn complete_reply(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r"SELECT id, payload FROM command_sent
              WHERE identity = $1 AND method = $2 AND status = 'sent'
              ORDER BY sent_at DESC
              LIMIT 1
              FOR UPDATE SKIP LOCKED",
        )
        .bind(identity.as_str())
        .bind(method.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let sent_id: i64 = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;

        sqlx::query("DELETE FROM command_sent WHERE id = $1")
            .bind(sent_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"UPDATE command_history
              SET status = 'successful', archived_at = NOW()
              WHERE identity = $1 AND direction = 'outgoing' AND payload = $2
                AND method = $3 AND status = 'sent'",
        )
        .bind(identity.as_str())
        .bind(&payload)
        .bind(method.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO command_history
                  (identity, direction, payload, status, method, created_at)
              VALUES ($1, 'incoming', $2, 'received', $3, NOW())",
        )
        .bind(identity.as_str())
        .bind(response)
        .bind(method.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_unmatched(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO command_history
                  (identity, direction, payload, status, method, created_at)
              VALUES ($1, 'incoming', $2, 'received', $3, NOW())",
        )
        .bind(identity.as_str())
        .bind(response)
        .bind(method.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_outbox(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"WITH expired AS (
                  DELETE FROM command_outbox
                  WHERE created_at < $1
                  RETURNING identity, method, payload, created_at
              )
              INSERT INTO command_history
                  (identity, direction, payload, status, method, created_at, archived_at)
              SELECT identity, 'outgoing', payload, 'failed', method, created_at, NOW()
              FROM expired",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expire_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"WITH expired AS (
                  DELETE FROM command_sent
                  WHERE status = 'sent' AND sent_at < $1
                  RETURNING identity, method, payload, created_at, sent_at
              )
              INSERT INTO command_history
                  (identity, direction, payload, status, method, created_at, sent_at, archived_at)
              SELECT identity, 'outgoing', payload, 'no_reply', method, created_at, sent_at, NOW()
              FROM expired",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

/// One history row as the fake records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub identity: Identity,
    pub direction: &'static str,
    pub payload: String,
    pub status: String,
    pub method: DeliveryMethod,
}

#[derive(Debug, Clone)]
struct SentRow {
    identity: Identity,
    method: DeliveryMethod,
    payload: String,
    sent_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    outbox: Vec<OutboxCommand>,
    sent: Vec<SentRow>,
    history: Vec<HistoryRow>,
    next_id: i64,
}

/// In-memory [`CommandStore`] with the same transition semantics as the
/// Postgres implementation.
#[derive(Default)]
pub struct MemoryCommandStore {
    state: Mutex<MemoryState>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        MemoryCommandStore::default()
    }

    /// Test hook standing in for the ops API insert.
    pub fn insert_outbox(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        payload: &str,
    ) -> i64 {
        self.insert_outbox_at(identity, method, payload, Utc::now())
    }

    /// Insert with an explicit creation instant, for expiry tests.
    pub fn insert_outbox_at(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> i64 {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.next_id += 1;
        let id = state.next_id;
        state.outbox.push(OutboxCommand {
            id,
            identity: identity.clone(),
            method,
            payload: payload.to_owned(),
            config_id: None,
            user_id: None,
            retry_count: 0,
            created_at,
        });
        id
    }

    pub fn history(&self) -> Vec<HistoryRow> {
        self.state.lock().expect("store mutex poisoned").history.clone()
    }

    pub fn outbox_len(&self) -> usize {
        self.state.lock().expect("store mutex poisoned").outbox.len()
    }

    pub fn sent_len(&self) -> usize {
        self.state.lock().expect("store mutex poisoned").sent.len()
    }

    /// Age a sent row backwards in time, for expiry tests.
    pub fn age_sent(&self, by: ChronoDuration) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        for row in &mut state.sent {
            row.sent_at -= by;
        }
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn fetch_outbox(
        &self,
        method: DeliveryMethod,
        connected: &[Identity],
        limit: i64,
    ) -> Result<Vec<OutboxCommand>, StoreError> {
        let state = self.state.lock().expect("store mutex poisoned");
        let mut rows: Vec<OutboxCommand> = state
            .outbox
            .iter()
            .filter(|c| c.method == method && connected.contains(&c.identity))
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn mark_sent(&self, command: &OutboxCommand) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let before = state.outbox.len();
        state.outbox.retain(|c| c.id != command.id);
        if state.outbox.len() == before {
            return Ok(false);
        }
        state.sent.push(SentRow {
            identity: command.identity.clone(),
            method: command.method,
            payload: command.payload.clone(),
            sent_at: Utc::now(),
        });
        state.history.push(HistoryRow {
            identity: command.identity.clone(),
            direction: "outgoing",
            payload: command.payload.clone(),
            status: "sent".to_owned(),
            method: command.method,
        });
        Ok(true)
    }

    async fn complete_reply(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let newest = state
            .sent
            .iter()
            .enumerate()
            .filter(|(_, r)| &r.identity == identity && r.method == method)
            .max_by_key(|(_, r)| r.sent_at)
            .map(|(i, _)| i);
        let Some(index) = newest else {
            return Ok(false);
        };
        let sent = state.sent.remove(index);
        if let Some(row) = state.history.iter_mut().find(|h| {
            h.identity == sent.identity
                && h.direction == "outgoing"
                && h.payload == sent.payload
                && h.method == method
                && h.status == "sent"
        }) {
            row.status = "successful".to_owned();
        }
        state.history.push(HistoryRow {
            identity: identity.clone(),
            direction: "incoming",
            payload: response.to_owned(),
            status: "received".to_owned(),
            method,
        });
        Ok(true)
    }

    async fn record_unmatched(
        &self,
        identity: &Identity,
        method: DeliveryMethod,
        response: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.history.push(HistoryRow {
            identity: identity.clone(),
            direction: "incoming",
            payload: response.to_owned(),
            status: "received".to_owned(),
            method,
        });
        Ok(())
    }

    async fn expire_outbox(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let expired: Vec<OutboxCommand> = state
            .outbox
            .iter()
            .filter(|c| c.created_at < cutoff)
            .cloned()
            .collect();
        state.outbox.retain(|c| c.created_at >= cutoff);
        for command in &expired {
            state.history.push(HistoryRow {
                identity: command.identity.clone(),
                direction: "outgoing",
                payload: command.payload.clone(),
                status: "failed".to_owned(),
                method: command.method,
            });
        }
        Ok(expired.len() as u64)
    }

    async fn expire_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let expired: Vec<SentRow> = state
            .sent
            .iter()
            .filter(|r| r.sent_at < cutoff)
            .cloned()
            .collect();
        state.sent.retain(|r| r.sent_at >= cutoff);
        for sent in &expired {
            if let Some(row) = state.history.iter_mut().find(|h| {
                h.identity == sent.identity
                    && h.direction == "outgoing"
                    && h.payload == sent.payload
                    && h.status == "sent"
            }) {
                row.status = "no_reply".to_owned();
            } else {
                state.history.push(HistoryRow {
                    identity: sent.identity.clone(),
                    direction: "outgoing",
                    payload: sent.payload.clone(),
                    status: "no_reply".to_owned(),
                    method: sent.method,
                });
            }
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        "123456789012345".parse().unwrap()
    }

    #[tokio::test]
    async fn outbox_fetch_filters_by_connection() {
        let store = MemoryCommandStore::new();
        let online = identity();
        let offline: Identity = "999999999999999".parse().unwrap();
        store.insert_outbox(&online, DeliveryMethod::Gprs, "getinfo");
        store.insert_outbox(&offline, DeliveryMethod::Gprs, "getinfo");
        store.insert_outbox(&online, DeliveryMethod::Sms, "getver");

        let rows = store
            .fetch_outbox(DeliveryMethod::Gprs, &[online.clone()], 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identity, online);
    }

    #[tokio::test]
    async fn mark_sent_is_single_shot() {
        let store = MemoryCommandStore::new();
        store.insert_outbox(&identity(), DeliveryMethod::Gprs, "getinfo");
        let rows = store
            .fetch_outbox(DeliveryMethod::Gprs, &[identity()], 10)
            .await
            .unwrap();
        assert!(store.mark_sent(&rows[0]).await.unwrap());
        // Second attempt loses the race.
        assert!(!store.mark_sent(&rows[0]).await.unwrap());
        assert_eq!(store.outbox_len(), 0);
        assert_eq!(store.sent_len(), 1);
    }

    #[tokio::test]
    async fn reply_matches_most_recent_sent() {
        let store = MemoryCommandStore::new();
        store.insert_outbox(&identity(), DeliveryMethod::Gprs, "getinfo");
        let rows = store
            .fetch_outbox(DeliveryMethod::Gprs, &[identity()], 10)
            .await
            .unwrap();
        store.mark_sent(&rows[0]).await.unwrap();

        assert!(store
            .complete_reply(&identity(), DeliveryMethod::Gprs, "OK")
            .await
            .unwrap());
        assert_eq!(store.sent_len(), 0);

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, "successful");
        assert_eq!(history[1].direction, "incoming");
        assert_eq!(history[1].status, "received");
        assert_eq!(history[1].payload, "OK");
    }

    #[tokio::test]
    async fn unmatched_reply_is_not_an_error() {
        let store = MemoryCommandStore::new();
        assert!(!store
            .complete_reply(&identity(), DeliveryMethod::Gprs, "ping")
            .await
            .unwrap());
        store
            .record_unmatched(&identity(), DeliveryMethod::Gprs, "ping")
            .await
            .unwrap();
        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "received");
    }

    #[tokio::test]
    async fn expiry_moves_rows_to_terminal_history() {
        let store = MemoryCommandStore::new();
        let stale = Utc::now() - ChronoDuration::minutes(5);
        store.insert_outbox_at(&identity(), DeliveryMethod::Gprs, "old", stale);
        store.insert_outbox(&identity(), DeliveryMethod::Gprs, "fresh");

        let expired = store
            .expire_outbox(Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.outbox_len(), 1);
        assert_eq!(store.history()[0].status, "failed");

        // Sent expiry: send the fresh one, age it, expire.
        let rows = store
            .fetch_outbox(DeliveryMethod::Gprs, &[identity()], 10)
            .await
            .unwrap();
        store.mark_sent(&rows[0]).await.unwrap();
        store.age_sent(ChronoDuration::minutes(10));
        let expired = store
            .expire_sent(Utc::now() - ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.sent_len(), 0);
        let history = store.history();
        assert!(history.iter().any(|h| h.status == "no_reply"));
    }
}
