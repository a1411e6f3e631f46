//! Record validation: range checks before anything touches the database.
//!
//! Failures are terminal: the record goes to the dead-letter queue with
//! the field and reason, never retried.

use crate::queue::StoredRecord;

/// A validation rejection: which field, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub field: &'static str,
    pub reason: &'static str,
}

pub fn validate(stored: &StoredRecord) -> Result<(), ValidationFailure> {
    let position = &stored.record.position;
    if !position.latitude.is_finite() || position.latitude.abs() > 90.0 {
        return Err(ValidationFailure {
            field: "latitude",
            reason: "position_out_of_range",
        });
    }
    if !position.longitude.is_finite() || position.longitude.abs() > 180.0 {
        return Err(ValidationFailure {
            field: "longitude",
            reason: "position_out_of_range",
        });
    }
    // The decoder flags implausible device clocks but still emits the
    // record for observability; this is the downstream filter that drops it.
    if !stored.record.timestamp_valid {
        return Err(ValidationFailure {
            field: "timestamp",
            reason: "timestamp_out_of_range",
        });
    }
    Ok(())
}
