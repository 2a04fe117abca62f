//! SAS data sets (`.sas7bdat`) and transport files (`.xpt`).

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::model::Value;

pub mod sas7bdat;
pub mod xport;

/// SAS timestamps count seconds from 1960-01-01T00:00:00.
pub fn datetime(seconds: f64) -> Option<NaiveDateTime> {
    if !seconds.is_finite() {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1960, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let millis = (seconds * 1000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    epoch.checked_add_signed(Duration::try_milliseconds(millis as i64)?)
}

/// Missing value for a NaN whose payload carries a SAS missing code: `._`,
/// `.` or `.A` to `.Z`.
pub fn missing_from_nan(bits: u64) -> Value {
    match !((bits >> 40) as u8) {
        0 => Value::TaggedMissing('_'),
        tag @ 2..=27 => Value::TaggedMissing((b'A' + tag - 2) as char),
        _ => Value::SystemMissing,
    }
}

/// Missing value for the leading byte of a transport file number whose
/// other bytes are zero.
pub fn missing_from_code(code: u8) -> Option<Value> {
    match code {
        b'.' => Some(Value::SystemMissing),
        b'_' | b'A'..=b'Z' => Some(Value::TaggedMissing(code as char)),
        _ => None,
    }
}
