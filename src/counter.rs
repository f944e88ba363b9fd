use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-channel pulse counters.
///
/// `snapshot_and_reset()` atomically reads and resets every counter, so no
/// edge recorded concurrently with a flush is lost or counted twice.
pub struct PulseCounters {
    counts: Vec<AtomicU64>,
}

impl PulseCounters {
    /// Create zeroed counters for the given number of channels.
    pub fn new(channels: usize) -> Self {
        Self {
            counts: (0..channels).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record one pulse edge on the given channel.
    pub fn record(&self, index: usize) {
        if let Some(counter) = self.counts.get(index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current count for a channel, without resetting it.
    pub fn get(&self, index: usize) -> u64 {
        self.counts
            .get(index)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Atomically read and reset all counters, returning only non-zero
    /// entries in channel-index order.
    pub fn snapshot_and_reset(&self) -> Vec<(usize, u64)> {
        let mut result = Vec::new();

        for (index, counter) in self.counts.iter().enumerate() {
            let count = counter.swap(0, Ordering::Relaxed);
            if count > 0 {
                result.push((index, count));
            }
        }

        result
    }
}
