//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op for metrics that were never initialized, so the
//! library can record unconditionally and leave `init_metrics()` to the binary.

use super::prometheus::{ENGINE_DURATION, SIMILARITY_SCORE, SUBJECTS_IN_PROGRESS, SUBJECTS_TOTAL};

/// Final outcome label of one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectOutcomeLabel {
    Succeeded,
    QcFlagged,
    Failed,
    Cancelled,
}

impl SubjectOutcomeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectOutcomeLabel::Succeeded => "succeeded",
            SubjectOutcomeLabel::QcFlagged => "qc_flagged",
            SubjectOutcomeLabel::Failed => "failed",
            SubjectOutcomeLabel::Cancelled => "cancelled",
        }
    }
}

/// Metrics collector for batch runs.
///
/// # Example
///
/// ```ignore
/// use vbm_forge::metrics::{init_metrics, MetricsCollector, SubjectOutcomeLabel};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_engine_run(1830.0);
/// collector.record_score(0.93);
/// collector.record_subject(SubjectOutcomeLabel::Succeeded);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a subject's final outcome.
    pub fn record_subject(&self, outcome: SubjectOutcomeLabel) {
        if let Some(total) = SUBJECTS_TOTAL.get() {
            total.with_label_values(&[outcome.as_str()]).inc();
        }

        tracing::trace!(outcome = outcome.as_str(), "Recorded subject metric");
    }

    /// Record a similarity score.
    pub fn record_score(&self, score: f64) {
        if let Some(histogram) = SIMILARITY_SCORE.get() {
            histogram.observe(score);
        }
    }

    /// Record one engine invocation's duration.
    pub fn record_engine_run(&self, duration_secs: f64) {
        if let Some(histogram) = ENGINE_DURATION.get() {
            histogram.observe(duration_secs);
        }

        tracing::trace!(duration_secs = duration_secs, "Recorded engine metric");
    }

    /// Mark a subject as started.
    pub fn subject_started(&self) {
        if let Some(gauge) = SUBJECTS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Mark a subject as finished.
    pub fn subject_finished(&self) {
        if let Some(gauge) = SUBJECTS_IN_PROGRESS.get() {
            gauge.dec();
        }
    }
}
