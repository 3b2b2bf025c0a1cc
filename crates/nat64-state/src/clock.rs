//! Monotonic time source for session deadlines.
//!
//! Session `dying_time` values are absolute deadlines computed as
//! `Instant::now() + timeout` through [`deadline`]. Production code reads `std::time::Instant`;
//! unit tests swap in `mock_instant::thread_local::Instant` so expiry can be
//! driven with `MockClock::advance` instead of sleeping through multi-hour
//! TCP timeouts.
//!
//! The thread-local flavour keeps each test thread on its own timeline.
//! Async tests must stay on a current-thread runtime for the same reason.

#[cfg(test)]
pub use mock_instant::thread_local::Instant;

#[cfg(not(test))]
pub use std::time::Instant;

#[cfg(test)]
pub use mock_instant::thread_local::MockClock;

use crate::config::MAX_TIMEOUT_SECS;
use std::time::Duration;

/// `now + timeout`, with `timeout` capped at [`MAX_TIMEOUT_SECS`].
///
/// Never panics: if the platform clock cannot represent the sum, the
/// deadline is `now` and the session expires on the next sweep.
pub fn deadline(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS));
    match now.checked_add(timeout) {
        Some(deadline) => deadline,
        None => {
            log::error!("Session deadline {:?} out of clock range", timeout);
            now
        }
    }
}
