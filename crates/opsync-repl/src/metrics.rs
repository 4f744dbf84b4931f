//! Prometheus text export of the master and replica status.

use crate::bootstrap::BootstrapPhase;
use crate::status::{MasterStatus, ReplicationStatus};

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "opsync_messages_sent_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a new gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    fn sample(&self) -> String {
        if self.labels.is_empty() {
            return format!("{} {}\n", self.name, self.format_value());
        }
        let label_str = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}} {}\n", self.name, label_str, self.format_value())
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&self.sample());
        output
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn label(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Metrics of the master role, one series per replica where it applies.
pub fn master_metrics(status: &MasterStatus) -> Vec<Metric> {
    let server = vec![label("server_id", status.server_id)];
    let mut metrics = vec![
        Metric::gauge(
            "opsync_master_channel_active",
            "Whether the broker link is open (1) or closed (0)",
            server.clone(),
            flag(status.channel_active),
        ),
        Metric::gauge(
            "opsync_master_replicas",
            "Registered replicas",
            server.clone(),
            status.replicas.len() as f64,
        ),
        Metric::gauge(
            "opsync_master_listened_replicables",
            "Replicables carrying the replication listener",
            server.clone(),
            status.listened_replicables.len() as f64,
        ),
        Metric::counter(
            "opsync_master_initial_loads_total",
            "Initial loads served",
            server.clone(),
            status.initial_loads_served as f64,
        ),
        Metric::gauge(
            "opsync_send_queue_jobs",
            "Blocks waiting in the send queue",
            server.clone(),
            status.send_queue.queued_jobs as f64,
        ),
        Metric::gauge(
            "opsync_send_queue_bytes",
            "Compressed bytes waiting in the send queue",
            server.clone(),
            status.send_queue.queued_bytes as f64,
        ),
        Metric::gauge(
            "opsync_send_queue_limit_bytes",
            "Byte budget of the send queue",
            server.clone(),
            status.send_queue.limit_bytes as f64,
        ),
        Metric::counter(
            "opsync_operations_submitted_total",
            "Operations submitted for replication",
            server.clone(),
            status.batcher.submitted_operations as f64,
        ),
        Metric::counter(
            "opsync_batches_flushed_total",
            "Batches handed to the send queue",
            server.clone(),
            status.batcher.flushed_batches as f64,
        ),
        Metric::counter(
            "opsync_batches_dropped_total",
            "Batches rejected by the full send queue",
            server.clone(),
            status.batcher.dropped_batches as f64,
        ),
        Metric::gauge(
            "opsync_batch_average_bytes",
            "Average compressed batch size",
            server.clone(),
            status.batcher.average_batch_bytes(),
        ),
        Metric::counter(
            "opsync_blocks_published_total",
            "Blocks published to the broker",
            server.clone(),
            status.sender.published as f64,
        ),
        Metric::counter(
            "opsync_publish_errors_total",
            "Failed publish attempts",
            server.clone(),
            status.sender.publish_errors as f64,
        ),
        Metric::gauge(
            "opsync_replicas_stale",
            "Whether a dropped block left replicas behind (1) or not (0)",
            server,
            flag(status.replicas_stale),
        ),
    ];

    for replica in &status.replicas {
        let labels = vec![
            label("replica_id", replica.descriptor.replica_id),
            label("address", &replica.descriptor.address),
        ];
        metrics.push(Metric::counter(
            "opsync_replica_messages_sent_total",
            "Messages sent to the replica",
            labels.clone(),
            replica.statistics.messages_sent as f64,
        ));
        metrics.push(Metric::counter(
            "opsync_replica_bytes_sent_total",
            "Compressed bytes sent to the replica",
            labels.clone(),
            replica.statistics.bytes_sent as f64,
        ));
        metrics.push(Metric::gauge(
            "opsync_replica_average_operations_per_message",
            "Average operations per message sent to the replica",
            labels.clone(),
            replica.average_operations_per_message,
        ));
        for (type_tag, count) in &replica.statistics.operations_by_type {
            let mut typed = labels.clone();
            typed.push(label("type", type_tag));
            metrics.push(Metric::counter(
                "opsync_replica_operations_sent_total",
                "Operations sent to the replica by type",
                typed,
                *count as f64,
            ));
        }
    }
    metrics
}

/// Metrics of the replica role.
pub fn replica_metrics(status: &ReplicationStatus) -> Vec<Metric> {
    let labels = vec![label(
        "master",
        status.master.as_deref().unwrap_or("none"),
    )];
    let mut metrics = vec![
        Metric::gauge(
            "opsync_replica_live",
            "Whether the replica applies live operations (1) or not (0)",
            labels.clone(),
            flag(status.phase == BootstrapPhase::Live && !status.failed),
        ),
        Metric::gauge(
            "opsync_replica_starting",
            "Whether a bootstrap is in progress",
            labels.clone(),
            flag(status.replication_starting),
        ),
        Metric::gauge(
            "opsync_replica_suspended",
            "Whether application of live operations is suspended",
            labels.clone(),
            flag(status.suspended),
        ),
        Metric::gauge(
            "opsync_replica_failed",
            "Whether an apply failure stopped the replica",
            labels.clone(),
            flag(status.failed),
        ),
        Metric::gauge(
            "opsync_replica_message_queue",
            "Buffered live messages",
            labels.clone(),
            status.message_queue_len as f64,
        ),
        Metric::counter(
            "opsync_replica_messages_received_total",
            "Live messages received",
            labels.clone(),
            status.messages_received as f64,
        ),
        Metric::counter(
            "opsync_replica_operations_applied_total",
            "Operations applied",
            labels.clone(),
            status.operations_applied as f64,
        ),
    ];
    for (replicable_id, pending) in &status.operation_queue_lens {
        let mut per_replicable = labels.clone();
        per_replicable.push(label("replicable", replicable_id));
        metrics.push(Metric::gauge(
            "opsync_replica_operation_queue",
            "Buffered operations per replicable",
            per_replicable,
            *pending as f64,
        ));
    }
    metrics
}

/// Format metrics as Prometheus text. Series sharing a name are grouped under one HELP/TYPE
/// header, in order of first appearance.
pub fn format_prometheus(metrics: &[Metric]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for metric in metrics {
        if !names.contains(&metric.name.as_str()) {
            names.push(&metric.name);
        }
    }
    let mut output = String::new();
    for name in names {
        let mut series = metrics.iter().filter(|m| m.name == name);
        if let Some(first) = series.next() {
            output.push_str(&first.format());
        }
        for metric in series {
            output.push_str(&metric.sample());
        }
    }
    output
}
