//! Per-operator dispatch gate
//!
//! A token bucket paces sends and bounds bursts. A one-second ledger of
//! recent sends backs it so no window of one second ever admits more than
//! `rate` messages, whatever the bucket holds.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Send instants inside the trailing window, oldest first
    sent: VecDeque<Instant>,
}

/// Burst is at most one second's worth of rate
fn capacity(rate: u32, burst: u32) -> f64 {
    burst.min(rate).max(1) as f64
}

impl TokenBucket {
    /// Starts full. A zero rate admits nothing.
    pub fn new(rate: u32, burst: u32, now: Instant) -> Self {
        let capacity = capacity(rate, burst);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate as f64,
            last_refill: now,
            sent: VecDeque::with_capacity(rate.min(4096) as usize),
        }
    }

    /// Apply a changed operator capacity without resetting the tokens held
    /// or forgetting recent sends
    pub fn reconfigure(&mut self, rate: u32, burst: u32, now: Instant) {
        self.refill(now);
        self.refill_per_sec = rate as f64;
        self.capacity = capacity(rate, burst);
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        while self
            .sent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= WINDOW)
        {
            self.sent.pop_front();
        }
    }

    fn window_full(&self) -> bool {
        self.sent.len() as f64 >= self.refill_per_sec
    }

    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens < 1.0 || self.window_full() {
            return false;
        }
        self.tokens -= 1.0;
        self.sent.push_back(now);
        true
    }

    /// Time until a take can succeed, `None` when it never will
    pub fn time_to_token(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        let for_token = if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        };
        let for_window = match self.sent.front() {
            Some(oldest) if self.window_full() => (*oldest + WINDOW).saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        Some(for_token.max(for_window))
    }

    pub fn rate(&self) -> f64 {
        self.refill_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Greatest number of takes inside any half-open one-second window
    fn busiest_second(takes: &[Instant]) -> usize {
        takes
            .iter()
            .map(|start| takes.iter().filter(|t| **t >= *start && **t < *start + WINDOW).count())
            .max()
            .unwrap_or(0)
    }

    /// Polls every millisecond for `ms` and records each successful take
    fn drain(bucket: &mut TokenBucket, start: Instant, ms: u64) -> Vec<Instant> {
        let mut takes = Vec::new();
        for tick in 0..ms {
            let now = start + Duration::from_millis(tick);
            while bucket.try_take(now) {
                takes.push(now);
            }
        }
        takes
    }

    #[test]
    fn test_burst_then_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 2, start);
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));

        // Tokens come back at 500ms, but both sends are still inside the window
        assert_eq!(bucket.time_to_token(start), Some(WINDOW));
        assert!(!bucket.try_take(start + Duration::from_millis(500)));
        assert!(bucket.try_take(start + WINDOW));
    }

    #[test]
    fn test_no_second_admits_more_than_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10, 10, start);
        let takes = drain(&mut bucket, start, 5_000);
        assert_eq!(busiest_second(&takes), 10);
        // Sustained throughput still reaches the rate
        assert!(takes.len() >= 49, "took {}", takes.len());
    }

    #[test]
    fn test_oversized_burst_is_clamped_to_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(5, 500, start);
        let takes = drain(&mut bucket, start, 3_000);
        assert_eq!(busiest_second(&takes), 5);
    }

    #[test]
    fn test_small_burst_paces_sends() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(4, 1, start);
        let takes = drain(&mut bucket, start, 1_000);
        let gaps: Vec<Duration> = takes.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(takes.len(), 4);
        assert!(gaps.iter().all(|gap| *gap >= Duration::from_millis(250)), "{gaps:?}");
    }

    #[test]
    fn test_reconfigure_caps_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100, 100, start);
        bucket.reconfigure(1, 1, start);
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start));
        assert_eq!(bucket.rate(), 1.0);
    }

    #[test]
    fn test_zero_rate_admits_nothing() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(0, 1, start);
        assert!(!bucket.try_take(start));
        assert_eq!(bucket.time_to_token(start), None);
    }
}
