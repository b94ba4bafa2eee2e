//! Lock-free counters and a sampled latency window, surfaced through the
//! admin stats endpoints

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_WINDOW: usize = 10_000;

/// Only goes up. Clones share the value.
#[derive(Clone, Debug)]
pub struct Counter {
    name: &'static str,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::default(),
        }
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Tracks a level such as open connections. Racing decrements may dip the
/// raw value below zero; reads clamp it.
#[derive(Clone, Debug)]
pub struct Gauge {
    name: &'static str,
    value: Arc<AtomicI64>,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::default(),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        u64::try_from(self.value.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Keeps the most recent samples only
#[derive(Clone, Debug)]
pub struct Histogram {
    name: &'static str,
    window: usize,
    samples: Arc<Mutex<VecDeque<f64>>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct HistogramSnapshot {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
}

impl Histogram {
    pub fn new(name: &'static str) -> Self {
        Self::with_window(name, DEFAULT_WINDOW)
    }

    pub fn with_window(name: &'static str, window: usize) -> Self {
        Self {
            name,
            window: window.max(1),
            samples: Arc::default(),
        }
    }

    pub fn record(&self, value: f64) {
        let mut samples = self.samples.lock();
        while samples.len() >= self.window {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    /// Nearest-rank percentiles over the current window
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSnapshot::default();
        }
        sorted.sort_by(f64::total_cmp);
        let rank = |p: f64| sorted[((sorted.len() as f64 * p) as usize).min(sorted.len() - 1)];
        HistogramSnapshot {
            count: sorted.len(),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: rank(0.50),
            p99: rank(0.99),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
