//! Per-queue decode and target-table mapping.

use fleet_proto::topology::{ALARMS_QUEUE, EVENTS_QUEUE, TELEMETRY_QUEUE};
use fleet_proto::{AlarmKind, AlarmRecord, Severity, TelemetryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Telemetry,
    Alarms,
    Events,
}

/// A record as it will be persisted: the telemetry body plus the alarm
/// classifier when the source queue carries one.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: TelemetryRecord,
    pub alarm_kind: Option<AlarmKind>,
    pub severity: Option<Severity>,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Telemetry, QueueKind::Alarms, QueueKind::Events];

    pub fn queue_name(self) -> &'static str {
        match self {
            QueueKind::Telemetry => TELEMETRY_QUEUE,
            QueueKind::Alarms => ALARMS_QUEUE,
            QueueKind::Events => EVENTS_QUEUE,
        }
    }

    pub fn target_table(self) -> &'static str {
        match self {
            QueueKind::Telemetry => "telemetry",
            QueueKind::Alarms => "alarms",
            QueueKind::Events => "events",
        }
    }

    pub fn decode(self, payload: &[u8]) -> Result<StoredRecord, serde_json::Error> {
        match self {
            QueueKind::Alarms => {
                let alarm: AlarmRecord = serde_json::from_slice(payload)?;
                Ok(StoredRecord {
                    record: alarm.record,
                    alarm_kind: Some(alarm.kind),
                    severity: Some(alarm.severity),
                })
            }
            QueueKind::Telemetry | QueueKind::Events => {
                let record: TelemetryRecord = serde_json::from_slice(payload)?;
                Ok(StoredRecord {
                    record,
                    alarm_kind: None,
                    severity: None,
                })
            }
        }
    }
}
