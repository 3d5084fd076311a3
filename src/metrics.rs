//! Prometheus metrics for observability
//!
//! All metrics live in the default registry and are exposed by the gateway
//! at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    register_int_counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    TextEncoder,
};

lazy_static! {
    // ── Sandboxes ───────────────────────────────────────────────────────
    pub static ref SANDBOX_PROVISIONS: CounterVec = register_counter_vec!(
        "shellvisor_sandbox_provisions_total",
        "Sandbox provisioning attempts by outcome (created, adopted, restarted, failed, timeout)",
        &["outcome"]
    ).unwrap();

    pub static ref SANDBOX_PROVISION_DURATION: Histogram = register_histogram!(
        "shellvisor_sandbox_provision_duration_seconds",
        "Time to create, adopt or restart a sandbox",
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref SANDBOX_CRASHES: IntCounter = register_int_counter!(
        "shellvisor_sandbox_crashes_total",
        "Sandboxes detected dead while in use"
    ).unwrap();

    // ── Executions ──────────────────────────────────────────────────────
    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "shellvisor_executions_total",
        "Finished executions by terminal state",
        &["state"]
    ).unwrap();

    pub static ref EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "shellvisor_execution_duration_seconds",
        "Wall time of executions by terminal state",
        &["state"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    ).unwrap();

    pub static ref EXECUTIONS_REJECTED: IntCounter = register_int_counter!(
        "shellvisor_executions_rejected_busy_total",
        "Executions refused because another was active for the user"
    ).unwrap();

    pub static ref STDIN_REQUESTS: IntCounter = register_int_counter!(
        "shellvisor_stdin_requests_total",
        "Interactive prompts detected and forwarded to clients"
    ).unwrap();

    // ── Gateway & events ────────────────────────────────────────────────
    pub static ref CONNECTIONS_ACTIVE: Gauge = register_gauge!(
        "shellvisor_connections_active",
        "Currently attached client connections"
    ).unwrap();

    pub static ref COMMANDS: CounterVec = register_counter_vec!(
        "shellvisor_commands_total",
        "Inbound commands by name and outcome",
        &["command", "outcome"]
    ).unwrap();

    pub static ref SLOW_CONSUMERS: IntCounter = register_int_counter!(
        "shellvisor_slow_consumers_total",
        "Subscribers dropped because their buffer overflowed"
    ).unwrap();

    pub static ref NOTIFICATIONS: CounterVec = register_counter_vec!(
        "shellvisor_notifications_total",
        "Notifications by stage (enqueued, delivered)",
        &["stage"]
    ).unwrap();

    pub static ref CHAT_TURNS: CounterVec = register_counter_vec!(
        "shellvisor_chat_turns_total",
        "Chat turns by outcome",
        &["outcome"]
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
