//! Metric names and recording helpers.

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!("upload_started_total", "Uploads started or resumed");
    describe_counter!("upload_completed_total", "Uploads finalized by the backend");
    describe_counter!("upload_failed_total", "Uploads that ended in the failed state");
    describe_counter!("upload_cancelled_total", "Uploads cancelled by the host");
    describe_counter!("upload_paused_total", "Pause requests honoured");
    describe_counter!("upload_parts_total", "Parts accepted by object storage");
    describe_counter!("upload_part_retries_total", "Part attempts that were retried");
    describe_counter!("upload_bytes_total", "Bytes accepted by object storage");

    describe_gauge!("upload_active", "Uploads with a running scheduler");

    describe_histogram!(
        "upload_part_duration_seconds",
        "Time to upload a single part, successful attempt only"
    );
    describe_histogram!(
        "upload_duration_seconds",
        "Wall time from start to completion of an upload run"
    );
}

pub fn record_upload_started(resumed: bool) {
    let kind = if resumed { "resume" } else { "start" };
    counter!("upload_started_total", "kind" => kind).increment(1);
    gauge!("upload_active").increment(1.0);
}

pub fn record_upload_completed(duration: Duration) {
    counter!("upload_completed_total").increment(1);
    gauge!("upload_active").decrement(1.0);
    histogram!("upload_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_upload_failed(reason: &'static str) {
    counter!("upload_failed_total", "reason" => reason).increment(1);
    gauge!("upload_active").decrement(1.0);
}

pub fn record_upload_paused() {
    counter!("upload_paused_total").increment(1);
    gauge!("upload_active").decrement(1.0);
}

/// An upload left `uploading` when the engine shut down. It is resumable
/// later but no longer active in this process.
pub fn record_upload_stopped() {
    gauge!("upload_active").decrement(1.0);
}

pub fn record_upload_cancelled(was_running: bool) {
    counter!("upload_cancelled_total").increment(1);
    if was_running {
        gauge!("upload_active").decrement(1.0);
    }
}

pub fn record_part_uploaded(bytes: u64, duration: Duration) {
    counter!("upload_parts_total").increment(1);
    counter!("upload_bytes_total").increment(bytes);
    histogram!("upload_part_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_part_retry(status: Option<u16>) {
    let status = status.map(|s| s.to_string()).unwrap_or_else(|| "network".into());
    counter!("upload_part_retries_total", "status" => status).increment(1);
}
