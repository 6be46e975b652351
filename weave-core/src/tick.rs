//! Virtual tick accounting shared by the reliable-messaging timer wheel and
//! tunnel connection manager backoff.
//!
//! A tick is a fixed slice of wall-clock time (default 200ms, §4.5). Modeling
//! timers in ticks instead of `Instant`s lets many timers share a single
//! armed system timer.

use core::time::Duration;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Number of whole ticks remaining until an event fires. Saturates at zero;
/// never goes negative.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickCount(pub u32);

impl TickCount {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn is_due(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn from_duration(duration: Duration, tick_interval: Duration) -> Self {
        if tick_interval.is_zero() {
            return Self(0);
        }
        let ticks = duration.as_nanos() / tick_interval.as_nanos().max(1);
        Self(ticks.min(u32::MAX as u128) as u32)
    }

    #[inline]
    pub fn expire(self, elapsed_ticks: u32) -> Self {
        Self(self.0.saturating_sub(elapsed_ticks))
    }

    #[inline]
    pub fn add(self, ticks: u32) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_saturates_at_zero() {
        let t = TickCount(2);
        assert_eq!(t.expire(5), TickCount::ZERO);
        assert!(t.expire(5).is_due());
    }

    #[test]
    fn from_duration_rounds_down() {
        let t = TickCount::from_duration(Duration::from_millis(450), Duration::from_millis(200));
        assert_eq!(t, TickCount(2));
    }
}
