// fleet-proto: record types transported over the broker, plus the broker
// topology names shared by publisher and consumers.
//
// All broker messages are JSON with serde; the routing key (not a payload
// field) discriminates record kind.

pub mod identity;
pub mod record;
pub mod topology;

pub use identity::{Identity, IdentityError};
pub use record::{
    AlarmKind, AlarmRecord, NetworkType, Position, RecordKind, Severity, TelemetryRecord,
};
