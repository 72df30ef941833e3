#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// `now`, or `prev` if the clock stepped backwards.
#[inline]
pub fn not_before(prev: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
	match prev {
		Some(prev) if prev > now => prev,
		_ => now,
	}
}
