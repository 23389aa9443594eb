use std::time::Duration;

use crate::config::AdaptiveConfig;

/// Adaptive poll-interval controller.
///
/// Grows the poll period while a queue stays idle and snaps back to the
/// initial period the moment work arrives, so a quiet queue costs few
/// broker round-trips without adding latency to a busy one.
///
/// The controller only engages when every knob is meaningful: a positive
/// multiplier, a positive idle threshold, and a maximum above the initial
/// interval. Otherwise it degenerates to a fixed-period timer.
#[derive(Debug)]
pub struct AdaptiveInterval {
    initial_ms: u64,
    current_ms: u64,
    idle_threshold_ms: u64,
    multiplier: u32,
    max_ms: u64,
    enabled: bool,
    idle_since_ms: Option<u64>,
}

impl AdaptiveInterval {
    pub fn new(config: &AdaptiveConfig, initial_ms: u64) -> Self {
        let enabled = config.backoff_multiplier > 0
            && config.idle_threshold_ms > 0
            && config.max_interval_ms > initial_ms;
        Self {
            initial_ms,
            current_ms: initial_ms,
            idle_threshold_ms: config.idle_threshold_ms,
            multiplier: config.backoff_multiplier,
            max_ms: config.max_interval_ms,
            enabled,
            idle_since_ms: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The interval the next poll should wait.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Whether the interval has grown to its ceiling.
    pub fn at_max(&self) -> bool {
        self.enabled && self.current_ms >= self.max_ms
    }

    /// A poll delivered entries: any backoff is cancelled immediately.
    pub fn on_busy(&mut self) {
        self.current_ms = self.initial_ms;
        self.idle_since_ms = None;
    }

    /// An empty poll observed at `now_ms` (milliseconds since epoch). The
    /// interval starts growing only once the queue has been idle for the
    /// configured threshold, then multiplies on every further empty poll
    /// until it hits the ceiling.
    pub fn on_idle(&mut self, now_ms: u64) {
        if !self.enabled {
            return;
        }
        let since = *self.idle_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) < self.idle_threshold_ms {
            return;
        }
        if self.current_ms < self.max_ms {
            self.current_ms = self
                .current_ms
                .saturating_mul(self.multiplier as u64)
                .min(self.max_ms);
        }
    }
}

/// Doubling retry backoff, used for acknowledgment retries. Starts at
/// `start_ms` and doubles up to `cap_ms`, where it stays; the caller
/// retries indefinitely.
#[derive(Debug)]
pub struct RetryBackoff {
    next_ms: u64,
    cap_ms: u64,
}

impl RetryBackoff {
    pub fn new(start_ms: u64, cap_ms: u64) -> Self {
        Self {
            next_ms: start_ms.max(1).min(cap_ms.max(1)),
            cap_ms: cap_ms.max(1),
        }
    }

    /// The delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.cap_ms);
        Duration::from_millis(delay)
    }
}
