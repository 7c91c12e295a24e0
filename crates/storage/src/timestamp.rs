//! Text timestamps as stored in every table: local time, second resolution,
//! `yyyy-MM-dd HH:mm:ss`. The format sorts lexicographically in time order.

use chrono::{Local, NaiveDateTime, Timelike};
use snafu::ResultExt;

use super::error::{InvalidTimestampSnafu, StorageResult};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    // Truncate to whole seconds so in-memory values equal what a reload returns.
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn format(value: &NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse(raw: &str, stage: &'static str) -> StorageResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).context(InvalidTimestampSnafu {
        stage,
        raw: raw.to_string(),
    })
}
