//! Hybrid-logical clock.
//!
//! The router stamps batches that don't require read consistency and feeds
//! timestamps observed in replica responses back into the local clock so
//! that causality is preserved across nodes.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid-logical timestamp: physical wall time plus a logical tiebreaker.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall time in nanoseconds since the unix epoch.
    pub wall_time: i64,
    /// Logical counter, used to order events with identical wall times.
    pub logical: i32,
}

impl Timestamp {
    /// The zero timestamp, used as an "unset" sentinel.
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// Advance `self` to `other` if `other` is larger.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.wall_time, self.logical)
    }
}

/// Source of physical time in nanoseconds.
pub type PhysicalSource = Box<dyn Fn() -> i64 + Send + Sync>;

/// Hybrid-logical clock guarded by its own lock.
///
/// `now` never goes backwards even if the physical source does, and `update`
/// merges timestamps received from remote nodes.
pub struct Clock {
    physical: PhysicalSource,
    state: Mutex<Timestamp>,
}

impl Clock {
    pub fn new(physical: PhysicalSource) -> Self {
        Self {
            physical,
            state: Mutex::new(Timestamp::ZERO),
        }
    }

    /// A clock backed by the system wall clock.
    pub fn system() -> Self {
        Self::new(Box::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .min(i64::MAX as u128) as i64
        }))
    }

    /// Return the current hybrid-logical time.
    pub fn now(&self) -> Timestamp {
        let physical = (self.physical)();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if physical > state.wall_time {
            state.wall_time = physical;
            state.logical = 0;
        } else {
            state.logical += 1;
        }
        *state
    }

    /// Merge a timestamp observed from a remote node into the clock.
    pub fn update(&self, remote: Timestamp) {
        if remote.is_zero() {
            return;
        }
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if remote > *state {
            *state = remote;
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn manual_clock(start: i64) -> (Clock, Arc<AtomicI64>) {
        let source = Arc::new(AtomicI64::new(start));
        let reader = source.clone();
        let clock = Clock::new(Box::new(move || reader.load(Ordering::Relaxed)));
        (clock, source)
    }

    #[test]
    fn now_is_monotonic_even_when_physical_time_stalls() {
        let (clock, _source) = manual_clock(100);
        let first = clock.now();
        let second = clock.now();
        assert!(second > first, "{second} should follow {first}");
        assert_eq!(second.wall_time, 100);
        assert!(second.logical > first.logical);
    }

    #[test]
    fn update_folds_in_remote_timestamps() {
        let (clock, _source) = manual_clock(100);
        clock.update(Timestamp {
            wall_time: 500,
            logical: 3,
        });
        let now = clock.now();
        assert!(now.wall_time >= 500);
        clock.update(Timestamp::ZERO);
        assert!(clock.now() > now, "zero update must not rewind the clock");
    }
}
