//! Metrics module for fee-ledger-service.
//! Provides Prometheus metrics for billing, payment and reporting operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Store query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "fee_ledger_db_query_duration_seconds",
            "Ledger store query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Bills written, by operation (create, update, bulk, amend)
pub static BILLS_WRITTEN_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Students per bulk billing outcome (processed, skipped)
pub static BULK_BILLING_STUDENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payments recorded, by method and initial status
pub static PAYMENTS_RECORDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Amount reconciled into fee records, by method
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Payment status transitions
pub static PAYMENT_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification dispatch failures
pub static NOTIFICATION_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Report build duration
pub static REPORT_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    BILLS_WRITTEN_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("fee_ledger_bills_written_total", "Fee records written by operation"),
            &["operation"]
        )
        .expect("Failed to register BILLS_WRITTEN_TOTAL")
    });

    BULK_BILLING_STUDENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_bulk_billing_students_total",
                "Students in bulk billing batches by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register BULK_BILLING_STUDENTS_TOTAL")
    });

    PAYMENTS_RECORDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_payments_recorded_total",
                "Payments appended by method and status"
            ),
            &["method", "status"]
        )
        .expect("Failed to register PAYMENTS_RECORDED_TOTAL")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "fee_ledger_payment_amount_total",
                "Amount reconciled into fee records by method"
            ),
            &["method"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    PAYMENT_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_payment_transitions_total",
                "Payment status transitions"
            ),
            &["from", "to"]
        )
        .expect("Failed to register PAYMENT_TRANSITIONS_TOTAL")
    });

    NOTIFICATION_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "fee_ledger_notification_failures_total",
                "Notifications that could not be delivered"
            ),
            &["category"]
        )
        .expect("Failed to register NOTIFICATION_FAILURES_TOTAL")
    });

    REPORT_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "fee_ledger_report_duration_seconds",
                "Time to build finance reports",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["report"]
        )
        .expect("Failed to register REPORT_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("fee_ledger_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_bill_written(operation: &str, count: u64) {
    if let Some(counter) = BILLS_WRITTEN_TOTAL.get() {
        counter.with_label_values(&[operation]).inc_by(count);
    }
}

pub fn record_bulk_billing(processed: usize, skipped: usize) {
    if let Some(counter) = BULK_BILLING_STUDENTS_TOTAL.get() {
        counter
            .with_label_values(&["processed"])
            .inc_by(processed as u64);
        counter.with_label_values(&["skipped"]).inc_by(skipped as u64);
    }
}

pub fn record_payment(method: &str, status: &str) {
    if let Some(counter) = PAYMENTS_RECORDED_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

pub fn record_reconciled_amount(method: &str, amount: f64) {
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[method]).inc_by(amount.abs());
    }
}

pub fn record_payment_transition(from: &str, to: &str) {
    if let Some(counter) = PAYMENT_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

pub fn record_notification_failure(category: &str) {
    if let Some(counter) = NOTIFICATION_FAILURES_TOTAL.get() {
        counter.with_label_values(&[category]).inc();
    }
}

pub fn record_report_duration(report: &str, duration_secs: f64) {
    if let Some(histogram) = REPORT_DURATION.get() {
        histogram.with_label_values(&[report]).observe(duration_secs);
    }
}

pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
