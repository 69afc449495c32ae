use std::time::{Duration, Instant};

/// Fixed-period deadline schedule anchored at a start instant.
///
/// Deadline `n` is `start + n * period`, so flush cost never shifts later
/// ticks. A flush that ends less than one period late is followed by an
/// immediate catch-up tick; ticks missed by a longer stall collapse into one.
#[derive(Clone, Debug)]
pub struct Ticker {
    start: Instant,
    period: Duration,
    tick: u64,
}

impl Ticker {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period: period.max(Duration::from_nanos(1)),
            tick: 1,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.start + self.offset(self.tick)
    }

    fn offset(&self, tick: u64) -> Duration {
        let nanos = self.period.as_nanos().saturating_mul(tick as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Move to the next deadline after a flush finishing at `now`. Returns the
    /// number of ticks dropped because the schedule fell more than one period behind.
    pub fn advance(&mut self, now: Instant) -> u64 {
        self.tick += 1;
        let elapsed = now.saturating_duration_since(self.start).as_nanos();
        // Latest tick whose deadline has already passed
        let latest_due = (elapsed / self.period.as_nanos()) as u64;
        if latest_due > self.tick {
            let skipped = latest_due - self.tick;
            self.tick = latest_due;
            skipped
        } else {
            0
        }
    }
}
