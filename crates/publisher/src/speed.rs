//! Smoothed events-per-second estimate

use std::time::Duration;

/// Time constant of the moving average
const WINDOW: Duration = Duration::from_secs(5);

/// Exponential moving average of the publish rate
#[derive(Debug, Clone, Default)]
pub struct SpeedEstimator {
    last_lines: u64,
    speed: f64,
    primed: bool,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the running total of published lines after `elapsed`
    ///
    /// Returns the updated rate in lines per second.
    pub fn update(&mut self, total_lines: u64, elapsed: Duration) -> f64 {
        let dt = elapsed.as_secs_f64();
        if dt <= 0.0 {
            return self.speed;
        }
        let rate = total_lines.saturating_sub(self.last_lines) as f64 / dt;
        self.last_lines = total_lines;

        if self.primed {
            let alpha = 1.0 - (-dt / WINDOW.as_secs_f64()).exp();
            self.speed += alpha * (rate - self.speed);
        } else {
            self.speed = rate;
            self.primed = true;
        }
        self.speed
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        self.speed
    }
}
