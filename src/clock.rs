//! Monotonic time and retry-timer state.
//!
//! The capture endpoint never registers callbacks with a scheduler; the
//! timer is plain data polled by the driver task. A cancelled timer is
//! disarmed data and therefore cannot fire after `cancel()` returns.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds since an arbitrary process-local epoch.
///
/// Monotonic and cheap; this is the time base for all timer decisions.
pub fn monotonic_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros().min(u64::MAX as u128) as u64
}

/// Offset between the UNIX epoch and the monotonic epoch, captured once.
fn wall_anchor_us() -> u64 {
    static ANCHOR: OnceLock<u64> = OnceLock::new();
    *ANCHOR.get_or_init(|| {
        let unix_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros()
            .min(u64::MAX as u128) as u64;
        unix_us.saturating_sub(monotonic_us())
    })
}

/// Wall-clock timestamp in microseconds since UNIX_EPOCH.
///
/// Derived as anchor + monotonic elapsed, so repeated calls cost no
/// syscall and never step backwards even if the system clock does.
pub fn wall_timestamp_us() -> u64 {
    wall_anchor_us().saturating_add(monotonic_us())
}

/// Periodic retry timer as pure state.
///
/// `fire()` reports at most one expiry per period and re-arms itself; the
/// driver polls it at whatever resolution it likes. Late polls do not burst:
/// the next deadline is computed from the poll time, not the missed one.
#[derive(Debug)]
pub struct RetryTimer {
    period_us: u64,
    deadline_us: Option<u64>,
}

impl RetryTimer {
    /// Creates a disarmed timer with the given period.
    pub fn new(period: Duration) -> Self {
        Self {
            period_us: period.as_micros().min(u64::MAX as u128) as u64,
            deadline_us: None,
        }
    }

    /// Arms the timer; the first expiry is one period from `now_us`.
    pub fn arm(&mut self, now_us: u64) {
        self.deadline_us = Some(now_us.saturating_add(self.period_us));
    }

    /// Disarms the timer. No expiry can be observed afterwards.
    pub fn cancel(&mut self) {
        self.deadline_us = None;
    }

    /// Whether the timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.deadline_us.is_some()
    }

    /// Returns `true` if the timer expired at or before `now_us`, re-arming
    /// it for the next period. Disarmed timers never fire.
    pub fn fire(&mut self, now_us: u64) -> bool {
        match self.deadline_us {
            Some(deadline) if now_us >= deadline => {
                self.deadline_us = Some(now_us.saturating_add(self.period_us));
                true
            }
            _ => false,
        }
    }
}
