use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A simple counter that can be incremented atomically
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    pub fn increment(&self, amount: usize) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram with fixed upper bounds; each value lands in every bucket it fits
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicUsize)>,
    count: AtomicUsize,
    sum: AtomicUsize,
    max: AtomicUsize,
}

impl Histogram {
    pub fn new(bucket_boundaries: &[f64]) -> Self {
        Self {
            buckets: bucket_boundaries
                .iter()
                .map(|&boundary| (boundary, AtomicUsize::new(0)))
                .collect(),
            count: AtomicUsize::new(0),
            sum: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }

    /// Buckets `start, start*factor, ...` (`count` of them)
    pub fn exponential(start: f64, factor: f64, count: usize) -> Self {
        let boundaries: Vec<f64> = std::iter::successors(Some(start), |b| Some(b * factor))
            .take(count)
            .collect();
        Self::new(&boundaries)
    }

    pub fn record(&self, value: f64) {
        let whole = value as usize;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(whole, Ordering::Relaxed);
        self.max.fetch_max(whole, Ordering::Relaxed);

        for (boundary, counter) in &self.buckets {
            if value <= *boundary {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> usize {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            count => self.sum() as f64 / count as f64,
        }
    }

    pub fn buckets(&self) -> Vec<(f64, usize)> {
        self.buckets
            .iter()
            .map(|(boundary, counter)| (*boundary, counter.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Records its lifetime, in microseconds, into a histogram when dropped
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    histogram: Arc<Histogram>,
}

impl Timer {
    pub fn new(histogram: Arc<Histogram>) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.histogram
            .record(self.start.elapsed().as_micros() as f64);
    }
}

/// Named counters and histograms
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<Counter>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Get or create a histogram with exponential buckets
    pub fn histogram(&self, name: &str, start: f64, factor: f64, count: usize) -> Arc<Histogram> {
        if let Some(histogram) = self.histograms.read().get(name) {
            return histogram.clone();
        }
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::exponential(start, factor, count)))
            .clone()
    }

    /// Timer backed by a microsecond histogram (1us to ~8s)
    pub fn timer(&self, name: &str) -> Timer {
        Timer::new(self.histogram(name, 1.0, 2.0, 24))
    }

    pub fn format(&self) -> String {
        let mut result = String::new();

        for (name, counter) in self.counters.read().iter() {
            result.push_str(&format!("{}: {}\n", name, counter.value()));
        }

        for (name, histogram) in self.histograms.read().iter() {
            result.push_str(&format!(
                "{}: count={}, sum={}, max={}, mean={:.2}\n",
                name,
                histogram.count(),
                histogram.sum(),
                histogram.max(),
                histogram.mean()
            ));
        }

        result
    }
}

/// Metrics for exchanges and the worker pool
#[derive(Debug, Default)]
pub struct MetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        self.registry.clone()
    }

    /// Count one finished exchange by outcome and status
    pub fn record_outcome(&self, outcome: &str, status: Option<u16>) {
        self.registry
            .counter(&format!("exchanges.{}", outcome))
            .increment(1);
        if let Some(status) = status {
            self.registry
                .counter(&format!("responses.{}", status))
                .increment(1);
        }
    }

    /// Count errors reported against an exchange, by kind
    pub fn record_error(&self, kind: &str) {
        self.registry
            .counter(&format!("errors.{}", kind))
            .increment(1);
    }

    pub fn time_exchange(&self, method: &str) -> Timer {
        self.registry.timer(&format!("exchange_time.{}", method))
    }

    /// Record how long a pool job waited in the queue before a worker took it
    pub fn record_pool_wait(&self, waited: Duration) {
        self.registry
            .histogram("pool.queue_wait_us", 1.0, 2.0, 24)
            .record(waited.as_micros() as f64);
    }

    pub fn format(&self) -> String {
        self.registry.format()
    }
}
