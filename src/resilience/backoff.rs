//! Exponential backoff with jitter and an elapsed-time budget

use std::time::Duration;
use tokio::time::Instant;

/// Backoff schedule parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `interval * (1 ± randomization_factor)`
    pub randomization_factor: f64,
    /// Cap on the un-randomized step
    pub max_interval: Duration,
    /// Total time after which the schedule stops (`None` = never)
    pub max_elapsed_time: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(300)),
        }
    }
}

/// Stateful exponential backoff
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_interval: Duration,
    started_at: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_interval = config.initial_interval;
        Self {
            config,
            current_interval,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Time since the schedule started or was last reset
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Restart the schedule from the initial interval
    pub fn reset(&mut self) {
        self.current_interval = self.config.initial_interval;
        self.started_at = Instant::now();
    }

    /// Next delay, or `None` once sleeping it would exceed the elapsed budget
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = randomize(
            self.current_interval,
            self.config.randomization_factor,
            rand::random::<f64>(),
        );

        if let Some(budget) = self.config.max_elapsed_time {
            if self.elapsed() + delay > budget {
                return None;
            }
        }

        self.current_interval = self.grow(self.current_interval);
        Some(delay)
    }

    fn grow(&self, interval: Duration) -> Duration {
        let max = self.config.max_interval;
        if interval.as_secs_f64() >= max.as_secs_f64() / self.config.multiplier {
            max
        } else {
            interval.mul_f64(self.config.multiplier)
        }
    }
}

/// Spread `interval` uniformly over `[interval - delta, interval + delta]`
fn randomize(interval: Duration, factor: f64, random: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = factor * base;
    let min = base - delta;
    let max = base + delta;
    Duration::from_secs_f64((min + random * (max - min)).max(0.0))
}
