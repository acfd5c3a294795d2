//! Microsecond-precision wall-clock timestamp
//!
//! Every entry records when it was created and last modified, every lock records
//! when it was acquired, and the clients ledger records disconnect times. All of
//! them share this type so comparisons never mix units.
//!
//! ```
//! use tessera_core::Timestamp;
//! use std::time::Duration;
//!
//! let acquired = Timestamp::from_millis(1_000);
//! let deadline = acquired.saturating_add(Duration::from_secs(5));
//! assert!(deadline.is_after(acquired));
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Maximum representable timestamp
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Current wall-clock time.
    ///
    /// A clock that reads before the epoch yields `EPOCH` rather than panicking.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as u64)
    }

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    #[inline]
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Milliseconds since epoch (truncates)
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Duration since an earlier timestamp, `None` if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_micros)
    }

    /// Time elapsed between this timestamp and now (zero if in the future).
    pub fn elapsed(&self) -> Duration {
        Timestamp::now().duration_since(*self).unwrap_or_default()
    }

    /// Saturates at `Timestamp::MAX`.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as u64))
    }

    /// Saturates at `Timestamp::EPOCH`.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as u64))
    }

    #[inline]
    pub fn is_before(&self, other: Timestamp) -> bool {
        self.0 < other.0
    }

    #[inline]
    pub fn is_after(&self, other: Timestamp) -> bool {
        self.0 > other.0
    }

    /// Convert to a chrono UTC datetime (for display and wire-level APIs).
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.0 as i64)
            .single()
            .unwrap_or_default()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::EPOCH
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros().max(0) as u64)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        let ts = Timestamp::from_secs(3);
        assert_eq!(ts.as_millis(), 3_000);
        assert_eq!(ts.as_micros(), 3_000_000);
        assert_eq!(Timestamp::from_millis(7).as_micros(), 7_000);
    }

    #[test]
    fn test_now_advances() {
        let before = Timestamp::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(Timestamp::now().is_after(before));
    }

    #[test]
    fn test_duration_since_is_directional() {
        let t1 = Timestamp::from_micros(1_000);
        let t2 = Timestamp::from_micros(3_500);
        assert_eq!(t2.duration_since(t1), Some(Duration::from_micros(2_500)));
        assert!(t1.duration_since(t2).is_none());
    }

    #[test]
    fn test_saturation() {
        assert_eq!(
            Timestamp::MAX.saturating_add(Duration::from_secs(1)),
            Timestamp::MAX
        );
        assert_eq!(
            Timestamp::EPOCH.saturating_sub(Duration::from_secs(1)),
            Timestamp::EPOCH
        );
    }

    #[test]
    fn test_elapsed_of_future_is_zero() {
        let future = Timestamp::now().saturating_add(Duration::from_secs(60));
        assert_eq!(future.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_chrono_round_trip() {
        let ts = Timestamp::from_micros(1_700_000_000_123_456);
        let back: Timestamp = ts.to_datetime().into();
        assert_eq!(ts, back);
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::from_micros(1_234_567_890).to_string(), "1234.567890");
    }
}
