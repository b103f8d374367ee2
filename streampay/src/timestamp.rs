//! Unix timestamp utilities for stream accounting windows.
//!
//! This module provides the [`UnixTimestamp`] type used throughout the
//! ledger to bound stream accrual, and the [`Clock`] trait through which
//! the ledger observes the current time. Accrual is always computed on
//! demand from a clock reading, never pre-materialized.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// A Unix timestamp representing whole seconds since the Unix epoch
/// (1970-01-01T00:00:00Z).
///
/// Stream boundaries (`startTime`, `stopTime`) and cancellation snapshots
/// are expressed in this type.
///
/// # Serialization
///
/// Serialized as a stringified integer to avoid loss of precision in JSON,
/// since `JavaScript`'s `Number` type cannot safely represent all 64-bit
/// integers.
///
/// ```json
/// "1699999999"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(Self(ts))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl UnixTimestamp {
    /// Creates a new [`UnixTimestamp`] from a raw seconds value.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Returns the current system time as a [`UnixTimestamp`].
    ///
    /// # Panics
    ///
    /// Panics if the system clock is set to a time before the Unix epoch,
    /// which should never happen on properly configured systems.
    #[must_use]
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_secs();
        Self(now)
    }

    /// Returns the timestamp as raw seconds since the Unix epoch.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the number of whole seconds from `earlier` to `self`,
    /// saturating to zero if `earlier` is in the future.
    #[must_use]
    pub const fn seconds_since(&self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Source of the current time for ledger accounting.
///
/// Implementations must be cheap to call; the ledger reads the clock on
/// every balance computation.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> UnixTimestamp;
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        UnixTimestamp::now()
    }
}

/// A manually driven clock, shared between clones.
///
/// Useful wherever elapsed time must be simulated deterministically:
/// accrual tests advance this clock instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given epoch seconds.
    #[must_use]
    pub fn starting_at(secs: u64) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(secs)),
        }
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute epoch-seconds value.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp {
        UnixTimestamp::from_secs(self.secs.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_serializes_as_string() {
        let ts = UnixTimestamp::from_secs(1_699_999_999);
        let serialized = serde_json::to_string(&ts).unwrap();
        assert_eq!(serialized, "\"1699999999\"");
    }

    #[test]
    fn test_timestamp_deserializes_from_string() {
        let ts: UnixTimestamp = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(ts.as_secs(), 42);
    }

    #[test]
    fn test_timestamp_rejects_non_integer() {
        let result: Result<UnixTimestamp, _> = serde_json::from_str("\"soon\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_seconds_since_saturates() {
        let early = UnixTimestamp::from_secs(100);
        let late = UnixTimestamp::from_secs(160);
        assert_eq!(late.seconds_since(early), 60);
        assert_eq!(early.seconds_since(late), 0);
    }

    #[test]
    fn test_manual_clock_advances_shared_state() {
        let clock = ManualClock::starting_at(1_000);
        let view = clock.clone();
        clock.advance(50);
        assert_eq!(view.now().as_secs(), 1_050);
        view.set(2_000);
        assert_eq!(clock.now().as_secs(), 2_000);
    }
}
