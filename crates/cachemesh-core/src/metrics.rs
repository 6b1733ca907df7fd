// Metrics module for observability
// Provides counters and gauges for discovery and replication

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Replication metrics
    describe_counter!(
        "cachemesh_replication_events_total",
        "Total number of mutation events accepted for replication"
    );
    describe_counter!(
        "cachemesh_replication_failures_total",
        "Total number of failed deliveries to a peer"
    );
    describe_gauge!(
        "cachemesh_replication_queue_size",
        "Events waiting in the asynchronous replication queue"
    );
    describe_histogram!(
        "cachemesh_replication_flush_duration_seconds",
        "Time taken to deliver one batch to all peers"
    );

    // Discovery metrics
    describe_counter!(
        "cachemesh_heartbeats_sent_total",
        "Total number of heartbeat datagrams sent"
    );
    describe_counter!(
        "cachemesh_heartbeats_received_total",
        "Total number of heartbeat datagrams received"
    );
    describe_counter!(
        "cachemesh_heartbeats_dropped_total",
        "Total number of heartbeat datagrams that could not be decoded"
    );
    describe_gauge!("cachemesh_peers_total", "Number of known peer urls");

    tracing::info!("Metrics initialized");
}

/// Record an event accepted by the replication dispatcher
pub fn record_replication_event(cache_name: &str, kind: &str) {
    counter!("cachemesh_replication_events_total", "cache" => cache_name.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Record a failed delivery to a peer
pub fn record_replication_failure(cache_name: &str) {
    counter!("cachemesh_replication_failures_total", "cache" => cache_name.to_string()).increment(1);
}

/// Update replication queue depth
pub fn set_replication_queue_size(cache_name: &str, size: usize) {
    gauge!("cachemesh_replication_queue_size", "cache" => cache_name.to_string()).set(size as f64);
}

/// Record how long a batch flush took
pub fn record_flush_duration(cache_name: &str, duration_secs: f64) {
    histogram!("cachemesh_replication_flush_duration_seconds", "cache" => cache_name.to_string()).record(duration_secs);
}

pub fn record_heartbeat_sent() {
    counter!("cachemesh_heartbeats_sent_total").increment(1);
}

pub fn record_heartbeat_received() {
    counter!("cachemesh_heartbeats_received_total").increment(1);
}

pub fn record_heartbeat_dropped() {
    counter!("cachemesh_heartbeats_dropped_total").increment(1);
}

/// Update known peer count
pub fn set_peer_count(total: usize) {
    gauge!("cachemesh_peers_total").set(total as f64);
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
