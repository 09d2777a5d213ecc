//! Timestamp naming and duration display
//!
//! Snapshot directories are named after their UTC start time in ISO-8601 form
//! with `:` replaced by `.` so the name is valid on every filesystem:
//! `2024-01-15T10.30.00`.

use crate::error::{CommonError, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use std::time::Duration;

const DIRECTORY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M.%S";

/// Current UTC time truncated to whole seconds, the resolution of directory names
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(DIRECTORY_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DIRECTORY_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| CommonError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// `H:MM:SS`, fractional seconds dropped
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
