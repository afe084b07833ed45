// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::{
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

pub const NANOSECOND: i64 = 1;
pub const MICROSECOND: i64 = NANOSECOND * 1000;
pub const MILLISECOND: i64 = MICROSECOND * 1000;
pub const SECOND: i64 = MILLISECOND * 1000;
pub const MINUTE: i64 = SECOND * 60;
pub const HOUR: i64 = MINUTE * 60;

// Nanoseconds since the Unix epoch.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixNano(i64);

impl UnixNano {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn now() -> Self {
        Self(
            i64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("time went backwards")
                    .as_nanos(),
            )
            .expect("timestamp to fit i64"),
        )
    }

    #[must_use]
    pub fn add_duration(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_add(duration.0)?))
    }

    #[must_use]
    pub fn sub_duration(&self, duration: Duration) -> Option<Self> {
        Some(Self(self.0.checked_sub(duration.0)?))
    }

    // Reports whether the time instant `self` is after `other`.
    #[must_use]
    pub fn after(&self, other: Self) -> bool {
        self.0 > other.0
    }

    // Reports whether the time instant `self` is before `other`.
    #[must_use]
    pub fn before(&self, other: Self) -> bool {
        self.0 < other.0
    }

    // Returns the duration self - u.
    #[must_use]
    pub fn sub(&self, u: Self) -> Option<Duration> {
        self.0.checked_sub(u.0).map(Duration)
    }

    /// Whole seconds since the epoch, truncated towards zero.
    #[must_use]
    pub fn as_secs(&self) -> i64 {
        self.0 / SECOND
    }

    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self(secs * SECOND)
    }

    /// Naive UTC representation used by the database.
    #[must_use]
    #[allow(clippy::as_conversions, clippy::cast_sign_loss)]
    pub fn as_naive_utc(&self) -> Option<NaiveDateTime> {
        let sec = self.0.div_euclid(SECOND);
        let nsec = self.0.rem_euclid(SECOND) as u32;
        Some(DateTime::from_timestamp(sec, nsec)?.naive_utc())
    }

    #[must_use]
    pub fn from_naive_utc(t: NaiveDateTime) -> Self {
        let utc = t.and_utc();
        Self(utc.timestamp() * SECOND + i64::from(utc.timestamp_subsec_nanos()))
    }

    pub const MAX: UnixNano = UnixNano(i64::MAX);
}

impl From<i64> for UnixNano {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for UnixNano {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// `std::time::Duration` but signed and without u128 conversions.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Duration(i64);

impl Duration {
    #[must_use]
    pub const fn new(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn from_millis(millis: u32) -> Self {
        Self(i64::from(millis) * MILLISECOND)
    }

    #[must_use]
    pub fn from_secs(secs: u32) -> Self {
        Self(i64::from(secs) * SECOND)
    }

    #[must_use]
    pub fn from_minutes(minutes: u32) -> Self {
        Self(i64::from(minutes) * MINUTE)
    }

    #[must_use]
    pub fn from_hours(hours: u32) -> Self {
        Self(i64::from(hours) * HOUR)
    }

    /// Fractional seconds, used for EXTINF durations.
    #[must_use]
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    pub fn as_secs_f64(&self) -> f64 {
        let sec = self.0 / SECOND;
        let nsec = self.0 % SECOND;
        (sec as f64) + (nsec as f64) / (SECOND as f64)
    }

    #[must_use]
    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::float_arithmetic
    )]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * (SECOND as f64)) as i64)
    }

    #[must_use]
    pub fn as_std(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_nanos(u64::try_from(self.0).ok()?))
    }

    #[must_use]
    pub fn until(time: UnixNano) -> Option<Self> {
        Some(Self(time.0.checked_sub(*UnixNano::now())?))
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_add(rhs.0)?))
    }

    #[must_use]
    pub fn checked_sub(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }
}

impl From<i64> for Duration {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for Duration {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0.0, 0; "zero")]
    #[test_case(5.005, 5 * SECOND + 5 * MILLISECOND; "extinf")]
    #[test_case(0.5, SECOND / 2; "half")]
    fn test_duration_from_secs_f64(secs: f64, want: i64) {
        assert_eq!(want, *Duration::from_secs_f64(secs));
    }

    #[test]
    fn test_duration_round_trip() {
        let d = Duration::from_secs_f64(4.985);
        assert!((d.as_secs_f64() - 4.985).abs() < 1e-9);
    }

    #[test]
    fn test_naive_utc_round_trip() {
        let t = UnixNano::new(1_700_000_000 * SECOND + 123 * MILLISECOND);
        let naive = t.as_naive_utc().unwrap();
        assert_eq!(t, UnixNano::from_naive_utc(naive));
    }

    #[test]
    fn test_after_before() {
        let a = UnixNano::new(1);
        let b = UnixNano::new(2);
        assert!(b.after(a));
        assert!(a.before(b));
        assert!(!a.after(a));
    }
}
