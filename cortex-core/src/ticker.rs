//! Fixed-rate tick pacing.
//!
//! Each tick is scheduled one period after the previous deadline. When
//! a tick runs long the baseline is reset to now instead of firing a
//! burst of catch-up ticks.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// How the last tick went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    OnTime,
    /// The tick took longer than one period.
    Overrun { late: Duration },
}

#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    deadline: Instant,
    overruns: u64,
}

impl Ticker {
    /// Ticker firing `rate` times per second.
    pub fn new(rate: u32) -> Self {
        let period = Duration::from_secs(1) / rate.max(1);
        Self::with_period(period)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            deadline: Instant::now(),
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Compute the next deadline given the current time.
    pub fn schedule(&mut self, now: Instant) -> Pace {
        let elapsed = now.saturating_duration_since(self.deadline);
        let pace = if elapsed > self.period {
            self.overruns += 1;
            self.deadline = now;
            Pace::Overrun {
                late: elapsed - self.period,
            }
        } else {
            Pace::OnTime
        };
        self.deadline += self.period;
        pace
    }

    /// Sleep until the next tick is due.
    pub async fn wait(&mut self) -> Pace {
        let pace = self.schedule(Instant::now());
        if let Pace::Overrun { late } = pace {
            warn!(late_ms = late.as_millis() as u64, "tick overrun, resetting baseline");
        }
        tokio::time::sleep_until(self.deadline).await;
        pace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_time_ticks_keep_a_fixed_grid() {
        let start = Instant::now();
        let mut t = Ticker::with_period(Duration::from_millis(40));
        t.deadline = start;
        assert_eq!(t.schedule(start + Duration::from_millis(10)), Pace::OnTime);
        assert_eq!(t.deadline, start + Duration::from_millis(40));
        assert_eq!(t.schedule(start + Duration::from_millis(70)), Pace::OnTime);
        assert_eq!(t.deadline, start + Duration::from_millis(80));
    }

    #[test]
    fn overrun_resets_baseline() {
        let start = Instant::now();
        let mut t = Ticker::with_period(Duration::from_millis(40));
        t.deadline = start;
        let late = start + Duration::from_millis(100);
        assert_eq!(
            t.schedule(late),
            Pace::Overrun {
                late: Duration::from_millis(60)
            }
        );
        assert_eq!(t.deadline, late + Duration::from_millis(40));
        assert_eq!(t.overruns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_one_period() {
        let mut t = Ticker::new(25);
        let start = Instant::now();
        t.wait().await;
        t.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(80));
    }
}
