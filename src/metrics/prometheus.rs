//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by vbm_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all vbm_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Subjects processed, labeled by outcome (succeeded, failed, qc_flagged, cancelled).
pub static SUBJECTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Distribution of QC similarity scores.
pub static SIMILARITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Engine preprocessing duration in seconds.
pub static ENGINE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Subject currently being processed (0 or 1 for a sequential run).
pub static SUBJECTS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let subjects_total = CounterVec::new(
        Opts::new("vbm_forge_subjects_total", "Total number of subjects processed"),
        &["outcome"],
    )?;

    let similarity_score = Histogram::with_opts(
        HistogramOpts::new(
            "vbm_forge_similarity_score",
            "Distribution of QC similarity scores against the reference template",
        )
        .buckets(vec![0.0, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0]),
    )?;

    let engine_duration = Histogram::with_opts(
        HistogramOpts::new(
            "vbm_forge_engine_duration_seconds",
            "Structural engine preprocessing duration in seconds",
        )
        .buckets(vec![60.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]),
    )?;

    let subjects_in_progress = Gauge::new(
        "vbm_forge_subjects_in_progress",
        "Number of subjects currently being processed",
    )?;

    registry.register(Box::new(subjects_total.clone()))?;
    registry.register(Box::new(similarity_score.clone()))?;
    registry.register(Box::new(engine_duration.clone()))?;
    registry.register(Box::new(subjects_in_progress.clone()))?;

    // Already-set statics mean metrics were initialized before (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = SUBJECTS_TOTAL.set(subjects_total);
    let _ = SIMILARITY_SCORE.set(similarity_score);
    let _ = ENGINE_DURATION.set(engine_duration);
    let _ = SUBJECTS_IN_PROGRESS.set(subjects_in_progress);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry was never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the exported metrics to a file.
pub fn write_metrics(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::write(path, export_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = SUBJECTS_TOTAL.get() {
            counter.with_label_values(&["succeeded"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("vbm_forge_subjects_total"));
    }

    #[test]
    fn test_write_metrics() {
        let _ = init_metrics();
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("metrics.prom");
        write_metrics(&path).unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().is_empty());
    }
}
