use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Source of the wall-clock time stamped onto published records.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn wall_time_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to. Starts at 1ms.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct MockClock {
    millis: Arc<AtomicU64>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::at(1)
    }
}

impl MockClock {
    #[must_use]
    pub fn at(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Advances the clock, returning the new time.
    pub fn add(&self, duration: Duration) -> u64 {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for MockClock {
    fn wall_time_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_is_shared_between_clones() {
        let clock = MockClock::default();
        let other = clock.clone();
        assert_eq!(clock.add(Duration::from_secs(1)), 1001);
        assert_eq!(other.wall_time_millis(), 1001);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.wall_time_millis() > 1_577_836_800_000);
    }
}
