//! Metric registration and recording helpers for the settlement pipeline.
//!
//! Uses the `metrics` facade; the binary decides which exporter (if any) to
//! install. All metric names are prefixed `checkout_`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Registers descriptions for every metric the pipeline emits. Call once at
/// startup, after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(
        "checkout_orders_created_total",
        "Orders created from cart checkouts"
    );
    describe_counter!(
        "checkout_orders_paid_total",
        "Orders that reached the paid status"
    );
    describe_counter!(
        "checkout_orders_cancelled_total",
        "Orders cancelled by their user"
    );
    describe_counter!(
        "checkout_orders_expired_total",
        "Orders expired by the reconciliation sweep"
    );
    describe_counter!(
        "checkout_revenue_minor_units_total",
        "Settled revenue in currency minor units"
    );
    describe_counter!(
        "checkout_callbacks_total",
        "Gateway notifications processed, labelled by outcome"
    );
    describe_counter!(
        "checkout_settlement_conflicts_total",
        "Integrity conflicts escalated to the operator channel"
    );
    describe_counter!(
        "checkout_sweep_runs_total",
        "Reconciliation sweep passes completed"
    );
    describe_histogram!(
        "checkout_sweep_duration_seconds",
        "Wall time of a reconciliation sweep pass"
    );
    describe_histogram!(
        "checkout_gateway_latency_seconds",
        "Latency of outbound gateway calls, labelled by call"
    );
}

/// Records settled revenue.
pub fn record_revenue(minor_units: u64) {
    counter!("checkout_revenue_minor_units_total").increment(minor_units);
}

/// Records a processed gateway notification or sweep verdict.
pub fn record_callback(outcome: &'static str) {
    counter!("checkout_callbacks_total", "outcome" => outcome).increment(1);
}

/// Records an escalated settlement conflict.
pub fn record_settlement_conflict() {
    counter!("checkout_settlement_conflicts_total").increment(1);
}

/// Records a completed sweep pass.
pub fn record_sweep(duration: Duration) {
    counter!("checkout_sweep_runs_total").increment(1);
    histogram!("checkout_sweep_duration_seconds").record(duration.as_secs_f64());
}

/// Records the latency of one outbound gateway call.
pub fn record_gateway_call(call: &'static str, duration: Duration) {
    histogram!("checkout_gateway_latency_seconds", "call" => call).record(duration.as_secs_f64());
}

/// Records an order lifecycle transition counter.
pub fn record_order(event: &'static str) {
    match event {
        "created" => counter!("checkout_orders_created_total").increment(1),
        "paid" => counter!("checkout_orders_paid_total").increment(1),
        "cancelled" => counter!("checkout_orders_cancelled_total").increment(1),
        "expired" => counter!("checkout_orders_expired_total").increment(1),
        _ => {}
    }
}
