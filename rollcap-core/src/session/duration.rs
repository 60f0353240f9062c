//! Usable-duration accounting.
//!
//! `elapsed` counts wall time while recording and not paused. It never moves
//! backwards and is clamped to zero. Time spent paused or under a
//! non-critical interruption is excluded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic time source. Injected so tests can drive time by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

pub struct DurationTracker {
    clock: Arc<dyn Clock>,
    /// Usable time banked before the current running stretch.
    banked: Duration,
    /// Start of the current running stretch; `None` while paused.
    running_since: Option<Instant>,
    window: Duration,
    window_reported: bool,
    last_reported: Duration,
}

impl DurationTracker {
    pub fn start(clock: Arc<dyn Clock>, window: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            banked: Duration::ZERO,
            running_since: Some(now),
            window,
            window_reported: false,
            last_reported: Duration::ZERO,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.running_since.is_none()
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.banked += self.clock.now().saturating_duration_since(since);
        }
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(self.clock.now());
        }
    }

    pub fn elapsed(&self) -> Duration {
        let running = self
            .running_since
            .map(|since| self.clock.now().saturating_duration_since(since))
            .unwrap_or_default();
        self.banked + running
    }

    /// Elapsed for a progress report, plus whether the window was just
    /// reached for the first time. Reported values never decrease.
    pub fn tick(&mut self) -> (Duration, bool) {
        let elapsed = self.elapsed().max(self.last_reported);
        self.last_reported = elapsed;
        let first_full = !self.window_reported && elapsed >= self.window;
        if first_full {
            self.window_reported = true;
        }
        (elapsed, first_full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(window_secs: u64) -> (ManualClock, DurationTracker) {
        let clock = ManualClock::new();
        let tracker = DurationTracker::start(Arc::new(clock.clone()), Duration::from_secs(window_secs));
        (clock, tracker)
    }

    #[test]
    fn excludes_paused_time() {
        let (clock, mut tracker) = tracker(60);
        clock.advance(Duration::from_secs(5));
        tracker.pause();
        clock.advance(Duration::from_secs(10));
        assert_eq!(tracker.elapsed(), Duration::from_secs(5));
        tracker.resume();
        clock.advance(Duration::from_secs(3));
        assert_eq!(tracker.elapsed(), Duration::from_secs(8));
    }

    #[test]
    fn pause_and_resume_are_idempotent() {
        let (clock, mut tracker) = tracker(60);
        clock.advance(Duration::from_secs(2));
        tracker.pause();
        tracker.pause();
        clock.advance(Duration::from_secs(2));
        tracker.resume();
        tracker.resume();
        clock.advance(Duration::from_secs(2));
        assert_eq!(tracker.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn reports_window_reached_once() {
        let (clock, mut tracker) = tracker(10);
        clock.advance(Duration::from_secs(9));
        assert_eq!(tracker.tick(), (Duration::from_secs(9), false));
        clock.advance(Duration::from_secs(1));
        assert_eq!(tracker.tick(), (Duration::from_secs(10), true));
        clock.advance(Duration::from_secs(1));
        assert_eq!(tracker.tick(), (Duration::from_secs(11), false));
    }
}
