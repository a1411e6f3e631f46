//! Telemetry, alarm, and event records as they travel through the broker.

use crate::identity::Identity;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use fleet_codec::data::RawRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cellular network technology, derived from the network I/O channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Unknown,
    Gsm,
    Umts,
    Lte,
}

impl NetworkType {
    pub fn from_code(code: Option<u64>) -> Self {
        match code {
            Some(1) => NetworkType::Gsm,
            Some(2) => NetworkType::Umts,
            Some(3) => NetworkType::Lte,
            _ => NetworkType::Unknown,
        }
    }
}

/// A GPS position sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i16,
    /// Degrees clockwise from north.
    pub heading: u16,
    /// km/h as reported by the device.
    pub speed: u16,
    pub satellites: u8,
}

impl Position {
    /// A point whose absolute latitude AND longitude are both below 0.1 is
    /// the receiver's cold-start output, not a fix.
    pub fn has_fix(&self) -> bool {
        self.latitude.abs() >= 0.1 || self.longitude.abs() >= 0.1
    }
}

/// One telemetry record, decoded and normalised to UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub identity: Identity,
    /// Gateway-assigned per-connection arrival sequence.
    pub sequence: u64,
    /// Device timestamp normalised to UTC via the configured offset.
    pub timestamp: DateTime<Utc>,
    /// False when the device timestamp fell outside plausible bounds;
    /// the record is still emitted for observability.
    pub timestamp_valid: bool,
    pub position: Position,
    /// Sparse I/O map, channel id to raw value.
    pub io: BTreeMap<u8, u64>,
    pub ignition: bool,
    /// Odometer in metres, when the device reports one.
    pub mileage_m: Option<u64>,
    pub network: NetworkType,
    /// Raw-frame fingerprint for deduplication.
    pub fingerprint: String,
}

impl TelemetryRecord {
    /// Build a record from a decoded frame record.
    ///
    /// Applies the decoder contract: the device-local timestamp is shifted
    /// by `utc_offset_minutes` to UTC, and implausible timestamps (before
    /// year 2000 or more than a year ahead of `now`) set
    /// `timestamp_valid = false`. Returns `None` when the position has no
    /// fix; those records are dropped from downstream publishing.
    pub fn from_raw(
        raw: &RawRecord,
        identity: Identity,
        sequence: u64,
        utc_offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let position = Position {
            latitude: raw.latitude,
            longitude: raw.longitude,
            altitude: raw.altitude,
            heading: raw.heading,
            speed: raw.speed,
            satellites: raw.satellites,
        };
        if !position.has_fix() {
            return None;
        }

        let device_local = Utc
            .timestamp_millis_opt(raw.timestamp_ms as i64)
            .single()
            .unwrap_or(now);
        let timestamp = device_local - Duration::minutes(i64::from(utc_offset_minutes));
        let timestamp_valid = timestamp.year() >= 2000 && timestamp <= now + Duration::days(365);

        Some(TelemetryRecord {
            identity,
            sequence,
            timestamp,
            timestamp_valid,
            position,
            io: raw.io.iter().map(|(k, v)| (*k, *v)).collect(),
            ignition: raw.ignition(),
            mileage_m: raw.odometer_m(),
            network: NetworkType::from_code(raw.network_code()),
            fingerprint: raw.fingerprint.clone(),
        })
    }

    /// Deduplication key: identity + device timestamp + frame fingerprint.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.identity,
            self.timestamp.timestamp_millis(),
            self.fingerprint
        )
    }
}

/// Classifier for alarm records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    PanicButton,
    Towing,
    Crash,
    Unplug,
    Generic,
}

impl AlarmKind {
    /// The I/O channel that triggered the record determines the kind.
    pub fn from_event_channel(channel: u8) -> Self {
        match channel {
            1 => AlarmKind::PanicButton,
            246 => AlarmKind::Towing,
            247 => AlarmKind::Crash,
            252 => AlarmKind::Unplug,
            _ => AlarmKind::Generic,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            AlarmKind::PanicButton | AlarmKind::Crash => Severity::Critical,
            AlarmKind::Towing | AlarmKind::Unplug | AlarmKind::Generic => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

/// A telemetry record flagged as an alarm, routed to the alarms queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    #[serde(flatten)]
    pub record: TelemetryRecord,
    pub kind: AlarmKind,
    pub severity: Severity,
}

/// Record kind, used to pick a routing key at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Telemetry,
    Event,
    Alarm,
}

impl RecordKind {
    /// The wire priority byte classifies the record: 0 periodic telemetry,
    /// 1 event, 2 alarm. Unknown priorities degrade to telemetry.
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            1 => RecordKind::Event,
            2 => RecordKind::Alarm,
            _ => RecordKind::Telemetry,
        }
    }
}
