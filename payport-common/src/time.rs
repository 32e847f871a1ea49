use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] to ease
///   interoperability with stores which don't support unsigned ints.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Returns the contained [`i64`].
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Construct directly from a non-negative milliseconds value. Mostly
    /// useful for fixed timestamps in tests.
    pub fn from_i64(ms: i64) -> Option<Self> {
        (ms >= 0).then_some(Self(ms))
    }

    /// This timestamp advanced by `duration`, saturating at the upper bound.
    /// Used for entitlement expiry arithmetic.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let add_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(add_ms))
    }
}

/// Get a [`SystemTime`] corresponding to this timestamp.
impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_millis(timestamp_u64)
    }
}

/// Attempts to convert a [`SystemTime`] into a [`TimestampMs`].
///
/// Returns an error if the [`SystemTime`] is not within bounds.
impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("Current time is before January 1st, 1970")?
            .context("Current time is more than 292 million years past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserialize_enforces_nonnegative() {
        assert_eq!(
            serde_json::from_str::<TimestampMs>("42").unwrap().as_i64(),
            42
        );
        assert_eq!(
            serde_json::from_str::<TimestampMs>("0").unwrap().as_i64(),
            0
        );
        assert!(serde_json::from_str::<TimestampMs>("-42").is_err());
    }

    #[test]
    fn saturating_add_saturates() {
        let ts = TimestampMs::from_i64(1_000).unwrap();
        assert_eq!(
            ts.saturating_add(Duration::from_millis(500)).as_i64(),
            1_500
        );

        let max = TimestampMs::from_i64(i64::MAX).unwrap();
        assert_eq!(
            max.saturating_add(Duration::from_secs(1)).as_i64(),
            i64::MAX
        );
    }

    #[test]
    fn ordering_is_chronological() {
        let early = TimestampMs::from_i64(1).unwrap();
        let late = TimestampMs::from_i64(2).unwrap();
        assert!(early < late);
        assert_eq!(early.max(late), late);
    }
}
