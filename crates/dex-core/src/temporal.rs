//! # Timestamps
//!
//! `Timestamp` is UTC-only and truncated to whole seconds so that offers,
//! agent registrations, and resolutions carrying a time canonicalize to the
//! same bytes on every peer. Non-`Z` inputs are rejected at parse time.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A UTC timestamp with seconds precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current UTC time, truncated to seconds.
    pub fn now() -> Self {
        Self(truncate_to_seconds(Utc::now()))
    }

    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(truncate_to_seconds(dt))
    }

    /// Parse an RFC 3339 string with a `Z` suffix.
    ///
    /// Explicit offsets, even `+00:00`, are rejected.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if !s.ends_with('Z') {
            return Err(CoreError::Validation(format!(
                "timestamp must use Z suffix (UTC only), got: {s:?}"
            )));
        }
        let dt = DateTime::parse_from_rfc3339(s).map_err(|e| {
            CoreError::Validation(format!("invalid RFC 3339 timestamp {s:?}: {e}"))
        })?;
        Ok(Self(truncate_to_seconds(dt.with_timezone(&Utc))))
    }

    pub fn from_epoch_secs(secs: i64) -> Result<Self, CoreError> {
        DateTime::from_timestamp(secs, 0)
            .map(Self)
            .ok_or_else(|| CoreError::Validation(format!("invalid unix timestamp: {secs}")))
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    pub fn epoch_secs(&self) -> i64 {
        self.0.timestamp()
    }

    /// The instant `duration` after this one, rounded up to whole seconds.
    ///
    /// Saturates at the largest representable timestamp.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let mut secs = duration.as_secs();
        if duration.subsec_nanos() > 0 {
            secs = secs.saturating_add(1);
        }
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs)
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }

    /// Render as `YYYY-MM-DDTHH:MM:SSZ`.
    pub fn to_iso8601(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_nanosecond(0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn now_has_no_subseconds() {
        assert_eq!(Timestamp::now().as_datetime().nanosecond(), 0);
    }

    #[test]
    fn from_utc_truncates() {
        let dt = Utc
            .with_ymd_and_hms(2026, 1, 15, 12, 30, 45)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        assert_eq!(Timestamp::from_utc(dt).to_iso8601(), "2026-01-15T12:30:45Z");
    }

    #[test]
    fn parse_accepts_only_z_suffix() {
        assert_eq!(
            Timestamp::parse("2026-01-15T12:00:00.987Z").unwrap().to_iso8601(),
            "2026-01-15T12:00:00Z"
        );
        assert!(Timestamp::parse("2026-01-15T12:00:00+00:00").is_err());
        assert!(Timestamp::parse("2026-01-15T08:00:00-04:00").is_err());
        assert!(Timestamp::parse("not-a-dateZ").is_err());
    }

    #[test]
    fn saturating_add_rounds_up_partial_seconds() {
        let base = Timestamp::parse("2026-01-15T12:00:00Z").unwrap();
        let later = base.saturating_add(Duration::from_millis(1500));
        assert_eq!(later.to_iso8601(), "2026-01-15T12:00:02Z");
        assert_eq!(base.saturating_add(Duration::ZERO), base);
    }

    #[test]
    fn saturating_add_does_not_overflow() {
        let base = Timestamp::parse("2026-01-15T12:00:00Z").unwrap();
        let far = base.saturating_add(Duration::from_secs(u64::MAX));
        assert!(far > base);
    }

    #[test]
    fn epoch_roundtrip_and_ordering() {
        let ts = Timestamp::parse("2026-01-15T12:00:00Z").unwrap();
        assert_eq!(Timestamp::from_epoch_secs(ts.epoch_secs()).unwrap(), ts);
        assert!(ts < Timestamp::parse("2026-01-15T12:00:01Z").unwrap());
    }

    #[test]
    fn serde_roundtrip_preserves_instant() {
        let ts = Timestamp::parse("2026-06-30T23:59:59Z").unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2026-06-30T23:59:59Z\"");
        assert_eq!(serde_json::from_str::<Timestamp>(&json).unwrap(), ts);
    }
}
