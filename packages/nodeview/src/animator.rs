//! Looping animation clock.
//!
//! The host calls [`Animator::on_frame`] from its single frame callback with
//! the frame timestamp. Once per tick period the normalized time advances by
//! one frame of the loop and wraps at 1.

#[derive(Debug, Clone, Default)]
pub struct Animator {
    frames_per_loop: u32,
    ticks_per_second: f64,
    /// Milliseconds between ticks.
    period_ms: f64,
    last_tick_ms: f64,
    time: f64,
}

impl Animator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the loop length in frames and the tick rate. Either being zero
    /// stops the clock.
    pub fn configure(&mut self, frames_per_loop: u32, ticks_per_second: f64) {
        self.frames_per_loop = frames_per_loop;
        self.ticks_per_second = ticks_per_second;
        self.period_ms = if ticks_per_second > 0.0 {
            1000.0 / ticks_per_second
        } else {
            0.0
        };
        log::debug!(
            "Animation: {} frames per loop at {} ticks/s",
            frames_per_loop,
            ticks_per_second
        );
    }

    pub fn is_running(&self) -> bool {
        self.frames_per_loop > 0 && self.ticks_per_second > 0.0
    }

    /// Returns the new time when this frame ticks.
    pub fn on_frame(&mut self, timestamp_ms: f64) -> Option<f64> {
        if !self.is_running() {
            return None;
        }
        if timestamp_ms - self.last_tick_ms <= self.period_ms {
            return None;
        }
        self.last_tick_ms = timestamp_ms;
        Some(self.step())
    }

    /// Advance one frame regardless of the wall clock.
    pub fn step(&mut self) -> f64 {
        if self.frames_per_loop > 0 {
            self.time = (self.time + 1.0 / self.frames_per_loop as f64) % 1.0;
        }
        self.time
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Back to time zero; the configuration is kept.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.last_tick_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_never_ticks() {
        let mut animator = Animator::new();
        assert_eq!(animator.on_frame(1000.0), None);
        animator.configure(0, 30.0);
        assert_eq!(animator.on_frame(2000.0), None);
        animator.configure(10, 0.0);
        assert_eq!(animator.on_frame(3000.0), None);
        assert_eq!(animator.time(), 0.0);
    }

    #[test]
    fn test_ticks_once_per_period() {
        let mut animator = Animator::new();
        animator.configure(4, 10.0);

        assert_eq!(animator.on_frame(50.0), None);
        assert_eq!(animator.on_frame(101.0), Some(0.25));
        assert_eq!(animator.on_frame(150.0), None);
        assert_eq!(animator.on_frame(202.0), Some(0.5));
    }

    #[test]
    fn test_time_wraps() {
        let mut animator = Animator::new();
        animator.configure(4, 60.0);
        let times: Vec<f64> = (0..5).map(|_| animator.step()).collect();
        assert_eq!(times, vec![0.25, 0.5, 0.75, 0.0, 0.25]);

        animator.reset();
        assert_eq!(animator.time(), 0.0);
        assert!(animator.is_running());
    }
}
