//! Upload metrics.
//!
//! Counters go through the `metrics` facade; installing a recorder
//! (Prometheus or otherwise) is the embedding application's job.  Without a
//! recorder every call here is a no-op.

use metrics::{counter, describe_counter};

use crate::types::CloudProvider;

// -- Metric name constants ----------------------------------------------------

/// Total dispatched operations (counter). Labels: operation, provider, status.
pub const OPERATIONS_TOTAL: &str = "upload_kit_operations_total";

/// Total bytes handed to adapters as in-memory buffers (counter). Labels: provider.
pub const BYTES_UPLOADED_TOTAL: &str = "upload_kit_bytes_uploaded_total";

/// Operation label values.
pub const OP_UPLOAD: &str = "upload";
pub const OP_PRESIGN: &str = "presign";

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(
        OPERATIONS_TOTAL,
        "Total upload and presign operations by provider and outcome"
    );
    describe_counter!(
        BYTES_UPLOADED_TOTAL,
        "Total bytes uploaded from in-memory buffers"
    );
}

/// Status label for an operation outcome.
fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

/// Count one adapter call.
pub fn record_operation<T, E>(operation: &'static str, provider: CloudProvider, result: &Result<T, E>) {
    counter!(
        OPERATIONS_TOTAL,
        "operation" => operation,
        "provider" => provider.as_str(),
        "status" => status_label(result)
    )
    .increment(1);
}

/// Count uploaded buffer bytes.
pub fn record_bytes_uploaded(provider: CloudProvider, bytes: usize) {
    counter!(BYTES_UPLOADED_TOTAL, "provider" => provider.as_str()).increment(bytes as u64);
}

// -- Tests --------------------------------------------------------------------
