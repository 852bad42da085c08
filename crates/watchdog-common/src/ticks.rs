//! Durable wall-clock representation
//!
//! Persisted schedule keys are 64-bit UTC ticks in 100-ns units counted from
//! the year-1 epoch, so `now`, check frequencies, and stored keys all share
//! one scale.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ticks per millisecond (100-ns units)
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Ticks per second (100-ns units)
pub const TICKS_PER_SECOND: i64 = 10_000_000;

// Offset of 1970-01-01T00:00:00Z from the year-1 epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// A UTC instant in 100-ns ticks since the year-1 epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let ticks = dt.timestamp() * TICKS_PER_SECOND + (dt.timestamp_subsec_nanos() as i64) / 100;
        Ticks(ticks + UNIX_EPOCH_TICKS)
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        let unix_ticks = self.0 - UNIX_EPOCH_TICKS;
        let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
        let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
    }

    /// Advance by a duration, saturating at the i64 boundary
    pub fn saturating_add(self, d: Duration) -> Self {
        let delta = (d.as_nanos() / 100).min(i64::MAX as u128) as i64;
        Ticks(self.0.saturating_add(delta))
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Ticks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
