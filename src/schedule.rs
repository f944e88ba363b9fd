use std::time::Duration;

use tokio::time::Instant;

/// Flush schedule for the aggregation window.
///
/// With a non-zero interval the deadline is advanced to `now + interval`
/// after every flush (drift-tolerant, not drift-correcting). A zero
/// interval means immediate mode: no deadline, every pulse reports itself.
#[derive(Debug)]
pub struct FlushSchedule {
    interval: Option<Duration>,
    next_deadline: Option<Instant>,
}

impl FlushSchedule {
    /// Create a schedule from the configured window length.
    pub fn new(interval: Duration) -> Self {
        if interval.is_zero() {
            Self {
                interval: None,
                next_deadline: None,
            }
        } else {
            Self {
                interval: Some(interval),
                next_deadline: Some(Instant::now() + interval),
            }
        }
    }

    /// True when pulses are reported individually instead of aggregated.
    pub fn is_immediate(&self) -> bool {
        self.interval.is_none()
    }

    /// Configured window length, if aggregating.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Next flush deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    /// Advance the deadline after a flush.
    pub fn advance(&mut self) {
        if let Some(interval) = self.interval {
            self.next_deadline = Some(Instant::now() + interval);
        }
    }
}
