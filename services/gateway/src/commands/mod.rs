//! Downlink command path: outbox poller, socket sender, response
//! correlator, and the timeout sweep.
//!
//! Commands flow: ops API inserts into `command_outbox` → the poller moves
//! rows to `command_sent` (+ history) and queues them in-process → the
//! sender encodes and writes on the device socket → the device's response
//! is matched by the correlator → history gets a terminal status. A sweep
//! expires whatever never completed.

pub mod correlator;
pub mod poller;
pub mod sender;
pub mod store;
pub mod sweep;

pub use store::{
    CommandStore, DeliveryMethod, MemoryCommandStore, OutboxCommand, PgCommandStore, StoreError,
};

/// Strip SMS-style credentials from a command body: `"login pass cmd"`
/// becomes `"cmd"`. Socket-delivered commands carry no authentication;
/// the credential prefix is an artifact of rows shared with the SMS path.
pub fn strip_sms_credentials(payload: &str) -> &str {
    let mut parts = payload.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_login), Some(_pass), Some(command)) => command,
        _ => payload,
    }
}
