//! Wall-clock abstraction.
//!
//! Fire times, lease expiries and execution timestamps all come from a
//! [`Clock`] so tests can pin "now" instead of sleeping.
//!
//! ```
//! use trogon_scheduler::clock::{Clock, SystemClock};
//!
//! let now = SystemClock.now();
//! assert!(now.timestamp() > 0);
//! ```

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `std` → `chrono` duration, saturating at a century for absurd values.
pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration, Utc};

    use super::Clock;

    /// Time only moves when you call [`advance`](MockClock::advance) or
    /// [`set`](MockClock::set). Clones share the same instant.
    #[derive(Clone)]
    pub struct MockClock {
        current: Arc<Mutex<DateTime<Utc>>>,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut current = self.current.lock().unwrap();
            *current += by;
        }

        pub fn set(&self, at: DateTime<Utc>) {
            *self.current.lock().unwrap() = at;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.current.lock().unwrap()
        }
    }
}
