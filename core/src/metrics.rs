// Metrics collection for bus and transport observability
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::{BusEvent, BusObserver};

/// Latency samples kept for percentile estimates.
const LATENCY_WINDOW: usize = 1000;

/// Snapshot consumed by dashboards outside the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub total_errors: u64,
    pub errors_by_kind: HashMap<String, u64>,
    pub error_rate: f64,
    pub uptime_secs: f64,
}

/// Metrics collector
pub struct MetricsCollector {
    messages: AtomicU64,
    errors: DashMap<String, u64>,
    latencies: Mutex<VecDeque<f64>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            errors: DashMap::new(),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            start_time: Instant::now(),
        }
    }

    /// Record a round-trip latency sample
    pub fn record_latency(&self, ms: f64) {
        let mut latencies = self.latencies.lock();
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(ms.max(0.0));
    }

    /// Record one message through the bus
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Get current stats
    pub fn get_system_stats(&self) -> SystemStats {
        let total_messages = self.messages.load(Ordering::Relaxed);
        let errors_by_kind: HashMap<String, u64> = self
            .errors
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let total_errors: u64 = errors_by_kind.values().sum();

        let mut sorted: Vec<f64> = self.latencies.lock().iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let avg_latency_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        let uptime_secs = self.start_time.elapsed().as_secs_f64();
        SystemStats {
            total_messages,
            messages_per_second: if uptime_secs > 0.0 {
                total_messages as f64 / uptime_secs
            } else {
                0.0
            },
            avg_latency_ms,
            p50_latency_ms: percentile(&sorted, 0.50),
            p95_latency_ms: percentile(&sorted, 0.95),
            p99_latency_ms: percentile(&sorted, 0.99),
            total_errors,
            errors_by_kind,
            error_rate: if total_messages > 0 {
                total_errors as f64 / total_messages as f64
            } else {
                0.0
            },
            uptime_secs,
        }
    }

    /// Print stats to log
    pub fn print_metrics(&self) {
        let stats = self.get_system_stats();
        info!("=== Metrics ===");
        info!("Total Messages: {}", stats.total_messages);
        info!("Messages/sec: {:.2}", stats.messages_per_second);
        info!("Avg Latency: {:.2}ms", stats.avg_latency_ms);
        info!("P95 Latency: {:.2}ms", stats.p95_latency_ms);
        info!("P99 Latency: {:.2}ms", stats.p99_latency_ms);
        info!("Error Rate: {:.2}%", stats.error_rate * 100.0);
    }

    pub fn reset(&self) {
        self.messages.store(0, Ordering::Relaxed);
        self.errors.clear();
        self.latencies.lock().clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl BusObserver for MetricsCollector {
    fn on_event(&self, event: &BusEvent) {
        match event {
            BusEvent::Sent { .. } | BusEvent::Received { .. } => self.record_message(),
            BusEvent::CallCompleted { latency_ms, .. } => self.record_latency(*latency_ms),
            BusEvent::Failed { kind, .. } => self.record_error(kind),
            BusEvent::Dropped { .. } => self.record_error("dropped"),
        }
    }
}

/// Nearest-rank percentile over pre-sorted samples.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let m = MetricsCollector::new();
        for ms in 1..=100 {
            m.record_latency(ms as f64);
        }
        let stats = m.get_system_stats();
        assert_eq!(stats.p50_latency_ms, 50.0);
        assert_eq!(stats.p95_latency_ms, 95.0);
        assert_eq!(stats.p99_latency_ms, 99.0);
        assert_eq!(stats.avg_latency_ms, 50.5);
    }

    #[test]
    fn errors_are_counted_by_kind() {
        let m = MetricsCollector::new();
        m.record_message();
        m.record_message();
        m.record_error("timeout");
        let stats = m.get_system_stats();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.errors_by_kind.get("timeout"), Some(&1));
        assert_eq!(stats.error_rate, 0.5);
    }
}
