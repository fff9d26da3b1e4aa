use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds source.
///
/// The policy engine layers its own rollback guard on top; implementations
/// just report what the platform believes the time is. A trait so tests can
/// script time.
pub trait WallClock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}
