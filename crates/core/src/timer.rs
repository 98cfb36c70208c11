//! Frame timer.

use std::time::{Duration, Instant};

/// Measures time between frames.
///
/// [`tick`](Self::tick) is called once per frame and returns the delta since the previous
/// tick, capped at [`max_delta`](Self::max_delta) so a long stall (window drag, breakpoint,
/// rebuild) does not turn into one huge simulation step.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    max_delta: Duration,
    frames: u64,
}

impl Timer {
    /// Delta cap used by [`Timer::new`].
    pub const DEFAULT_MAX_DELTA: Duration = Duration::from_millis(250);

    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        Self::with_max_delta(Self::DEFAULT_MAX_DELTA)
    }

    /// Create a timer with a custom delta cap.
    pub fn with_max_delta(max_delta: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            max_delta,
            frames: 0,
        }
    }

    /// Total elapsed time since the timer was created or reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Time since the last tick, capped at the max delta. Counts one frame.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = (now - self.last_tick).min(self.max_delta);
        self.last_tick = now;
        self.frames += 1;
        delta
    }

    /// [`tick`](Self::tick) in seconds.
    pub fn delta_secs(&mut self) -> f32 {
        self.tick().as_secs_f32()
    }

    /// Number of ticks so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn max_delta(&self) -> Duration {
        self.max_delta
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.frames = 0;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_capped() {
        let mut timer = Timer::with_max_delta(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_frame_count_and_reset() {
        let mut timer = Timer::new();
        timer.tick();
        timer.tick();
        assert_eq!(timer.frame_count(), 2);

        timer.reset();
        assert_eq!(timer.frame_count(), 0);
        assert!(timer.tick() <= Timer::DEFAULT_MAX_DELTA);
    }
}
