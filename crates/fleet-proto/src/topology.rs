//! Broker topology names shared by the publisher and both consumers.
//!
//! One named exchange; three durable queues bound by routing key, plus the
//! engine's own queue bound to the telemetry key. Each source queue has a
//! dead-letter queue on the dead-letter exchange.

use crate::record::RecordKind;

/// The single named exchange all records are published to.
pub const EXCHANGE: &str = "fleet.records";
/// Dead-letter exchange; rejected messages land here.
pub const DEAD_LETTER_EXCHANGE: &str = "fleet.dlx";

pub const TELEMETRY_QUEUE: &str = "telemetry_queue";
pub const ALARMS_QUEUE: &str = "alarms_queue";
pub const EVENTS_QUEUE: &str = "events_queue";
/// The metric engine's private binding of the telemetry stream.
pub const ENGINE_QUEUE: &str = "metrics_queue";

pub const ROUTING_TELEMETRY: &str = "record.telemetry";
pub const ROUTING_ALARM: &str = "record.alarm";
pub const ROUTING_EVENT: &str = "record.event";

/// Headers attached to dead-lettered messages.
pub const HEADER_REASON: &str = "x-reason";
pub const HEADER_FIELD: &str = "x-field";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";

impl RecordKind {
    pub fn routing_key(self) -> &'static str {
        match self {
            RecordKind::Telemetry => ROUTING_TELEMETRY,
            RecordKind::Alarm => ROUTING_ALARM,
            RecordKind::Event => ROUTING_EVENT,
        }
    }

    pub fn queue(self) -> &'static str {
        match self {
            RecordKind::Telemetry => TELEMETRY_QUEUE,
            RecordKind::Alarm => ALARMS_QUEUE,
            RecordKind::Event => EVENTS_QUEUE,
        }
    }
}

/// Name of the dead-letter queue paired with a source queue.
pub fn dead_letter_queue(source_queue: &str) -> String {
    format!("{source_queue}.dlq")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_are_distinct() {
        assert_ne!(RecordKind::Telemetry.routing_key(), RecordKind::Alarm.routing_key());
        assert_ne!(RecordKind::Alarm.routing_key(), RecordKind::Event.routing_key());
    }

    #[test]
    fn dlq_naming() {
        assert_eq!(dead_letter_queue(TELEMETRY_QUEUE), "telemetry_queue.dlq");
    }
}
