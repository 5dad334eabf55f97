//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks subject outcomes, QC score distribution and engine run time.
//!
//! # Example
//!
//! ```ignore
//! use vbm_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_score(0.94);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, SubjectOutcomeLabel};
pub use prometheus::{export_metrics, init_metrics, write_metrics};
