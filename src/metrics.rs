//! Prometheus metrics for Switchyard.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! (with its built-in scrape listener) and defines the metric name
//! constants recorded by the coordination components. Without an installed
//! recorder every `counter!`/`histogram!` call is a no-op, which is what
//! unit tests rely on.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

// -- Metric name constants ----------------------------------------------------

/// Mastership events observed (counter). Labels: kind.
pub const MASTERSHIP_EVENTS_TOTAL: &str = "switchyard_mastership_events_total";

/// Failed or timed-out store operations (counter). Labels: op.
pub const STORE_ERRORS_TOTAL: &str = "switchyard_store_errors_total";

/// Replica-info events handed to listeners (counter). Labels: kind.
pub const REPLICA_EVENTS_TOTAL: &str = "switchyard_replica_events_total";

/// Mastership events discarded because a newer revision was already applied (counter).
pub const REPLICA_STALE_EVENTS_TOTAL: &str = "switchyard_replica_stale_events_total";

/// Replica-info events waiting for the notifier thread (gauge).
pub const REPLICA_QUEUE_DEPTH: &str = "switchyard_replica_queue_depth";

/// Listener callbacks that failed or panicked (counter). Labels: event.
pub const LISTENER_FAILURES_TOTAL: &str = "switchyard_listener_failures_total";

/// Accumulator flushes (counter). Labels: trigger.
pub const ACCUMULATOR_FLUSHES_TOTAL: &str = "switchyard_accumulator_flushes_total";

/// Items per accumulator flush (histogram).
pub const ACCUMULATOR_BATCH_SIZE: &str = "switchyard_accumulator_batch_size";

/// Topology builds by outcome (counter). Labels: outcome.
pub const TOPOLOGY_BUILDS_TOTAL: &str = "switchyard_topology_builds_total";

// -- Global recorder installation ---------------------------------------------

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global Prometheus recorder and its scrape endpoint on
/// `listen`. Idempotent; must be called from within a tokio runtime.
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;
    let _ = INSTALLED.set(());
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(MASTERSHIP_EVENTS_TOTAL, "Mastership events observed");
    describe_counter!(STORE_ERRORS_TOTAL, "Failed or timed-out store operations");
    describe_counter!(REPLICA_EVENTS_TOTAL, "Replica-info events delivered");
    describe_counter!(
        REPLICA_STALE_EVENTS_TOTAL,
        "Mastership events discarded as stale"
    );
    describe_gauge!(REPLICA_QUEUE_DEPTH, "Replica-info events awaiting delivery");
    describe_counter!(LISTENER_FAILURES_TOTAL, "Listener callbacks that failed");
    describe_counter!(ACCUMULATOR_FLUSHES_TOTAL, "Accumulator flushes by trigger");
    describe_histogram!(ACCUMULATOR_BATCH_SIZE, "Items per accumulator flush");
    describe_counter!(TOPOLOGY_BUILDS_TOTAL, "Topology builds by outcome");
}
