//! Time source

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock source consulted for token validity and expiry decisions
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time
    fn now(&self) -> SystemTime;
}

/// [`Clock`] backed by [`SystemTime::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Convert a JWT NumericDate to a `SystemTime`
///
/// `None` when the value is beyond what the platform clock can represent.
pub(crate) fn from_unix(secs: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// Seconds since the epoch, saturating at zero for pre-epoch times
pub(crate) fn to_unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
