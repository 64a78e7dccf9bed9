//! Metrics for the consumer engine
//!
//! Provides Prometheus-compatible metrics for:
//! - Message outcomes (received, committed, rolled back, poison, error-routed)
//! - Heartbeat and receive failures
//! - Processing latency
//! - Active workers

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn record_message_received(queue: &str) {
    counter!("wq_messages_received_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_message_committed(queue: &str) {
    counter!("wq_messages_committed_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_message_rolled_back(queue: &str, reason: &str) {
    counter!(
        "wq_messages_rolled_back_total",
        "queue" => queue.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_poison_message(queue: &str) {
    counter!("wq_poison_messages_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_message_error_routed(queue: &str) {
    counter!("wq_messages_error_routed_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_receive_failure(queue: &str) {
    counter!("wq_receive_failures_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_heartbeat_failure(queue: &str) {
    counter!("wq_heartbeat_failures_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_processing_latency(queue: &str, duration: Duration) {
    histogram!("wq_processing_duration_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_message_sent(queue: &str) {
    counter!("wq_messages_sent_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_monitor_run(queue: &str, monitor: &str, affected: usize) {
    counter!(
        "wq_monitor_affected_total",
        "queue" => queue.to_string(),
        "monitor" => monitor.to_string()
    )
    .increment(affected as u64);
}

pub fn set_active_workers(queue: &str, count: usize) {
    gauge!("wq_active_workers", "queue" => queue.to_string()).set(count as f64);
}
