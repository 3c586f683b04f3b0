//! Prometheus-compatible metrics
//!
//! Lock-free counters and gauges for the coordination paths (heartbeats,
//! elections, proposals, allocation) plus per-endpoint request latency.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Process-wide metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    // Heartbeat endpoint
    pub heartbeats_received: Counter,
    pub heartbeats_redirected: Counter,

    // Allocation
    pub volumes_assigned: Counter,
    pub insufficient_capacity: Counter,
    pub placement_conflicts: Counter,

    // Consensus
    pub elections_started: Counter,
    pub elections_won: Counter,
    pub proposals_committed: Counter,
    pub proposals_failed: Counter,
    pub current_term: Gauge,
    pub is_leader: Gauge,

    // Storage node
    pub heartbeats_sent: Counter,
    pub heartbeat_failures: Counter,
    pub volumes_hosted: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            heartbeats_received: Counter::new(),
            heartbeats_redirected: Counter::new(),
            volumes_assigned: Counter::new(),
            insufficient_capacity: Counter::new(),
            placement_conflicts: Counter::new(),
            elections_started: Counter::new(),
            elections_won: Counter::new(),
            proposals_committed: Counter::new(),
            proposals_failed: Counter::new(),
            current_term: Gauge::new(),
            is_leader: Gauge::new(),
            heartbeats_sent: Counter::new(),
            heartbeat_failures: Counter::new(),
            volumes_hosted: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        self.endpoints
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 11] = [
            ("heartbeats_received_total", "Heartbeats received by this master", &self.heartbeats_received),
            ("heartbeats_redirected_total", "Heartbeats answered with a redirect", &self.heartbeats_redirected),
            ("volumes_assigned_total", "Volume ids committed by this leader", &self.volumes_assigned),
            ("insufficient_capacity_total", "Assign requests failed for lack of capacity", &self.insufficient_capacity),
            ("placement_conflicts_total", "Placements rejected at commit time", &self.placement_conflicts),
            ("elections_started_total", "Elections started", &self.elections_started),
            ("elections_won_total", "Elections won", &self.elections_won),
            ("proposals_committed_total", "Proposals committed", &self.proposals_committed),
            ("proposals_failed_total", "Proposals failed or timed out", &self.proposals_failed),
            ("heartbeats_sent_total", "Heartbeats sent by this storage node", &self.heartbeats_sent),
            ("heartbeat_failures_total", "Heartbeat attempts that failed", &self.heartbeat_failures),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP miniblob_{} {}", name, help);
            let _ = writeln!(out, "# TYPE miniblob_{} counter", name);
            let _ = writeln!(out, "miniblob_{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 4] = [
            ("raft_term", "Current Raft term", self.current_term.get()),
            ("raft_is_leader", "1 if this master is the leader", self.is_leader.get()),
            ("volumes_hosted", "Volumes hosted by this storage node", self.volumes_hosted.get()),
            ("uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP miniblob_{} {}", name, help);
            let _ = writeln!(out, "# TYPE miniblob_{} gauge", name);
            let _ = writeln!(out, "miniblob_{} {}", name, value);
        }

        let endpoints = self.endpoints.lock();

        out.push_str("# HELP miniblob_endpoint_requests_total Requests per endpoint\n");
        out.push_str("# TYPE miniblob_endpoint_requests_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "miniblob_endpoint_requests_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_total.get()
            );
        }

        out.push_str("# HELP miniblob_endpoint_errors_total Errors per endpoint\n");
        out.push_str("# TYPE miniblob_endpoint_errors_total counter\n");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "miniblob_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }

        out.push_str("# HELP miniblob_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE miniblob_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "miniblob_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "miniblob_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "miniblob_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();
        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.last().map(|b| b.1), Some(3));
        assert_eq!(buckets[1], (5.0, 1));
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.heartbeats_received.inc();
        registry.current_term.set(4);
        registry.record_request("/heartbeat", Duration::from_millis(3), true);
        registry.record_request("/heartbeat", Duration::from_millis(3), false);

        let text = registry.to_prometheus();
        assert!(text.contains("miniblob_heartbeats_received_total 1"));
        assert!(text.contains("miniblob_raft_term 4"));
        assert!(text.contains("miniblob_endpoint_errors_total{path=\"/heartbeat\"} 1"));
        assert!(text.contains("le=\"+Inf\"} 2"));
    }
}
