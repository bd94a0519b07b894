//! Metrics for the upload engine.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host installs a recorder, e.g. with [`start_metrics_server`].

pub mod exporter;
pub mod recorder;

pub use exporter::{render_metrics, start_metrics_server, MetricsConfig, MetricsError};
pub use recorder::{
    init_metrics, record_part_retry, record_part_uploaded, record_upload_cancelled,
    record_upload_completed, record_upload_failed, record_upload_paused, record_upload_started,
    record_upload_stopped,
};
