//! Clocks used by the coordination protocols.
//!
//! [`LogicalClock`] orders mutual-exclusion requests. [`LocalClock`] is the
//! adjustable wall clock that the Berkeley round reconciles.

use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// Lamport clock owned by one participant.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advances the clock for a local event and returns the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Folds in a timestamp seen on an incoming message: `max(local, seen) + 1`.
    pub fn witness(&self, seen: u64) -> u64 {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let next = current.max(seen) + 1;
            match self
                .value
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

type TimeSource = Arc<dyn Fn() -> f64 + Send + Sync>;

/// A node's notion of wall time in seconds, plus the corrections applied to it.
#[derive(Clone)]
pub struct LocalClock {
    source: TimeSource,
    skew: Arc<Mutex<f64>>,
}

impl LocalClock {
    /// Follows the system clock shifted by `skew` seconds.
    pub fn system(skew: f64) -> Self {
        Self {
            source: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64()
            }),
            skew: Arc::new(Mutex::new(skew)),
        }
    }

    /// A clock that reads `reading` until it is adjusted.
    pub fn frozen(reading: f64) -> Self {
        Self {
            source: Arc::new(|| 0.0),
            skew: Arc::new(Mutex::new(reading)),
        }
    }

    pub fn now(&self) -> f64 {
        (self.source)() + *self.skew.lock()
    }

    /// Offset of this clock from the authority's reference reading.
    pub fn delta_from(&self, reference: f64) -> f64 {
        self.now() - reference
    }

    pub fn apply_adjustment(&self, adjustment: f64) -> f64 {
        let mut skew = self.skew.lock();
        *skew += adjustment;
        (self.source)() + *skew
    }
}

impl std::fmt::Debug for LocalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClock").field("now", &self.now()).finish()
    }
}
