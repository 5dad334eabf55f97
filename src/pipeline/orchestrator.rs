//! Batch orchestrator.
//!
//! This module provides the `BatchOrchestrator` that coordinates one run:
//! - Engine pre-flight and output directory checks
//! - Subject resolution and manifest setup
//! - The sequential per-subject loop with cooperative cancellation
//! - Manifest curation, run logs and the flagged-subjects record
//! - Packaging and the final payload

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{expected_outputs, OutputKey, OutputRole, StructuralEngine};
use crate::error::{ArchiveError, IntakeError, ManifestInconsistencyError, SubjectError};
use crate::manifest::{CovariatesTable, ManifestCurator};
use crate::metrics::{MetricsCollector, SubjectOutcomeLabel};
use crate::quality::{QualityGate, FLAGGED_FILENAME};
use crate::report::{create_archive, RunAggregator, RunPayload, RunSummary, UNWRITABLE_MESSAGE};
use crate::subjects::{resolve, resolve_covariate_files, Subject};
use crate::volume::Volume;

use super::config::{ConfigError, RunConfig, ARCHIVE_DIR};
use super::runner::{SubjectOutcome, SubjectRunner};

/// Run log, one JSON line per subject.
pub const RUN_LOG_FILENAME: &str = "vbm_log.txt";

/// Machine-readable run summary, written next to the archive.
pub const SUMMARY_FILENAME: &str = "run_summary.json";

/// Error-log message for subjects never reached.
pub const CANCELLED_MESSAGE: &str = "cancelled before processing";

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The data source could not be resolved into subjects.
    #[error("Subject resolution failed: {0}")]
    Resolve(#[from] IntakeError),

    /// Covariates and regression files went out of step.
    #[error("Manifest inconsistency: {0}")]
    Manifest(#[from] ManifestInconsistencyError),

    /// The engine failed its pre-flight check.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The reference template could not be loaded.
    #[error("Reference template '{path}' unusable: {reason}")]
    Reference { path: String, reason: String },

    /// No subjects to process.
    #[error("No subjects found in the data source")]
    NoSubjects,

    /// Packaging the output tree failed.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared flag checked between subjects.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Subjects not yet started will be skipped.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub payload: RunPayload,
    /// Absent when the run stopped before the loop (unwritable output directory).
    pub summary: Option<RunSummary>,
}

/// One line of the run log.
#[derive(Debug, Serialize)]
struct RunLogRecord<'a> {
    timestamp: DateTime<Utc>,
    run_id: Uuid,
    ordinal: usize,
    subject: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Coordinates one batch run over all resolved subjects.
pub struct BatchOrchestrator {
    config: RunConfig,
    engine: Arc<dyn StructuralEngine>,
    cancellation: CancellationFlag,
    scratch_root: Option<PathBuf>,
    metrics: MetricsCollector,
}

impl BatchOrchestrator {
    /// Creates an orchestrator. The configuration is final from here on.
    pub fn new(config: RunConfig, engine: Arc<dyn StructuralEngine>) -> Self {
        Self {
            config,
            engine,
            cancellation: CancellationFlag::new(),
            scratch_root: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Uses an externally owned cancellation flag.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    /// Sets where per-subject scratch areas are created (system temp dir by default).
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Root of the packaged output tree: `<output_dir>/vbm_outputs`.
    pub fn run_root(&self) -> PathBuf {
        self.config.output_dir.join(ARCHIVE_DIR)
    }

    /// Path of the packaged output tree.
    pub fn archive_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}.tar.gz", ARCHIVE_DIR))
    }

    /// Runs the batch and returns the payload.
    pub async fn run(&self) -> Result<RunPayload, PipelineError> {
        self.execute().await.map(|report| report.payload)
    }

    /// Runs the batch and returns the payload together with the run summary.
    pub async fn execute(&self) -> Result<BatchReport, PipelineError> {
        self.config.validate()?;
        self.preflight().await?;

        if let Err(e) = check_writable(&self.config.output_dir) {
            error!(
                dir = %self.config.output_dir.display(),
                error = %e,
                "Output directory is not writable"
            );
            return Ok(BatchReport {
                payload: RunPayload::terminal(UNWRITABLE_MESSAGE),
                summary: None,
            });
        }

        let (subjects, mut manifest) = self.resolve_subjects()?;
        if subjects.is_empty() {
            return Err(PipelineError::NoSubjects);
        }

        let reference = Volume::open(&self.config.reference_template).map_err(|e| {
            PipelineError::Reference {
                path: self.config.reference_template.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let run_root = self.run_root();
        std::fs::create_dir_all(&run_root)?;
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            subjects = subjects.len(),
            output = %run_root.display(),
            "Starting VBM batch"
        );

        let mut runner =
            SubjectRunner::new(&self.config, self.engine.clone(), Arc::new(reference), &run_root);
        if let Some(root) = &self.scratch_root {
            runner = runner.with_scratch_root(root);
        }
        let mut gate = QualityGate::from_config(self.config.qc());

        // One slot per ordinal; `None` means the subject was never started
        let mut slots: Vec<Option<Result<SubjectOutcome, SubjectError>>> =
            (0..subjects.len()).map(|_| None).collect();
        for subject in &subjects {
            if self.cancellation.is_cancelled() {
                warn!(
                    remaining = subjects.len() - subject.ordinal_index,
                    "Cancellation requested, skipping remaining subjects"
                );
                break;
            }
            self.metrics.subject_started();
            let result = runner.run(subject, &mut gate).await;
            self.metrics.subject_finished();
            if let Err(e) = &result {
                warn!(subject = %subject.label(), stage = %e.stage, error = %e, "Subject failed");
            }
            slots[subject.ordinal_index] = Some(result);
        }

        let mut summary = RunSummary::new(run_id, subjects.len());
        let mut log = std::fs::File::create(run_root.join(RUN_LOG_FILENAME))?;
        let mut first_success: Option<&SubjectOutcome> = None;

        for (subject, slot) in subjects.iter().zip(&slots) {
            let label = subject.label();
            let ordinal = subject.ordinal_index;
            let mut record = RunLogRecord {
                timestamp: Utc::now(),
                run_id,
                ordinal,
                subject: &label,
                status: "",
                stage: None,
                score: None,
                error: None,
            };

            match slot {
                Some(Ok(outcome)) => {
                    summary.record_success(&outcome.verdict);
                    record.score = Some(outcome.score);
                    if outcome.passed() {
                        manifest.replace_path(ordinal, outcome.regression_path.display().to_string())?;
                        record.status = "succeeded";
                        self.metrics.record_subject(SubjectOutcomeLabel::Succeeded);
                    } else {
                        manifest.remove(ordinal)?;
                        record.status = "qc_flagged";
                        self.metrics.record_subject(SubjectOutcomeLabel::QcFlagged);
                    }
                    if first_success.is_none() {
                        first_success = Some(outcome);
                    }
                }
                Some(Err(e)) => {
                    summary.record_failure(&label, e.to_string());
                    manifest.remove(ordinal)?;
                    record.status = "failed";
                    record.stage = Some(e.stage.to_string());
                    record.error = Some(e.to_string());
                    self.metrics.record_subject(SubjectOutcomeLabel::Failed);
                }
                None => {
                    summary.record_failure(&label, CANCELLED_MESSAGE);
                    manifest.remove(ordinal)?;
                    record.status = "cancelled";
                    record.error = Some(CANCELLED_MESSAGE.to_string());
                    self.metrics.record_subject(SubjectOutcomeLabel::Cancelled);
                }
            }

            let line = serde_json::to_string(&record).map_err(std::io::Error::from)?;
            writeln!(log, "{}", line)?;
        }
        drop(log);

        manifest.verify()?;

        gate.write_flagged(&run_root.join(FLAGGED_FILENAME))?;
        summary.qc_flagged = gate.flagged().to_vec();

        if manifest.has_covariates() && self.config.regression().export_type_tables {
            let stems: Vec<String> = expected_outputs(&self.config.engine_settings())
                .iter()
                .map(OutputKey::stem)
                .collect();
            manifest.export_type_tables(&subjects, &run_root, &run_root, &stems)?;
        }

        let display = match first_success {
            Some(outcome) => self.publish_preview(outcome, &run_root),
            None => None,
        };

        if self.config.archive {
            let info = create_archive(&run_root, &self.archive_path())?;
            info!(
                archive = %info.path.display(),
                files = info.files,
                sha256 = %info.sha256,
                "Packaged outputs"
            );
            summary.archive_path = Some(info.path);
            summary.archive_sha256 = Some(info.sha256);
        }

        summary.finish();
        let payload = RunAggregator::new(self.config.reporting().clone())
            .finalize(&summary, &manifest)
            .with_display(display);
        summary.write_json(&self.config.output_dir.join(SUMMARY_FILENAME))?;

        info!(
            run_id = %run_id,
            succeeded = summary.succeeded,
            qc_passed = summary.qc_passed,
            failed = summary.failed(),
            "VBM batch finished"
        );

        Ok(BatchReport {
            payload,
            summary: Some(summary),
        })
    }

    async fn preflight(&self) -> Result<(), PipelineError> {
        let version = self
            .engine
            .version()
            .await
            .map_err(|e| PipelineError::EngineUnavailable(e.to_string()))?;
        debug!(engine = self.engine.name(), version = %version, "Engine pre-flight");

        if let Some(expected) = &self.config.engine.expected_version {
            if &version != expected {
                return Err(PipelineError::EngineUnavailable(format!(
                    "expected version {}, found {}",
                    expected, version
                )));
            }
        }
        Ok(())
    }

    fn resolve_subjects(&self) -> Result<(Vec<Subject>, ManifestCurator), PipelineError> {
        let regression = self.config.regression();
        match &regression.covariates {
            Some(path) => {
                let table = CovariatesTable::load(path, regression.covariates_base_dir.as_deref())?;
                let subjects = resolve_covariate_files(&table.files);
                let manifest = ManifestCurator::with_covariates(table, &subjects)?;
                Ok((subjects, manifest))
            }
            None => {
                let subjects = resolve(&self.config.data)?;
                let manifest = ManifestCurator::from_subjects(&subjects);
                Ok((subjects, manifest))
            }
        }
    }

    /// Copies the first successful subject's normalized grey-matter map to the
    /// run root and returns its rendered preview, base64-encoded.
    fn publish_preview(&self, outcome: &SubjectOutcome, run_root: &Path) -> Option<String> {
        if let Some(preview) = &outcome.preview {
            let dest = run_root.join(OutputKey::tissue(OutputRole::Normalized, 1).file_name());
            if let Err(e) = std::fs::copy(preview, &dest) {
                warn!(error = %e, "Failed to copy preview volume");
            }
        }

        let image = outcome.preview_image.as_ref()?;
        match std::fs::read(image) {
            Ok(bytes) => Some(BASE64.encode(bytes)),
            Err(e) => {
                warn!(path = %image.display(), error = %e, "Failed to read preview image");
                None
            }
        }
    }
}

/// Creates `dir` and verifies a file can be written inside it.
fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".vbm-write-check-{}", Uuid::new_v4()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineJob;
    use crate::error::EngineError;
    use crate::pipeline::config::{DataSource, EngineSettings};
    use async_trait::async_trait;

    struct VersionOnly(&'static str);

    #[async_trait]
    impl StructuralEngine for VersionOnly {
        fn name(&self) -> &str {
            "version-only"
        }

        async fn version(&self) -> Result<String, EngineError> {
            Ok(self.0.to_string())
        }

        async fn run_preprocess(
            &self,
            _job: &EngineJob,
            _settings: &EngineSettings,
        ) -> Result<(), EngineError> {
            Err(EngineError::Unsupported("preprocessing".to_string()))
        }
    }

    #[test]
    fn test_cancellation_flag_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_paths() {
        let config = RunConfig::default().with_output_dir("/tmp/out");
        let orchestrator = BatchOrchestrator::new(config, Arc::new(VersionOnly("12.7169")));
        assert_eq!(orchestrator.run_root(), PathBuf::from("/tmp/out/vbm_outputs"));
        assert_eq!(
            orchestrator.archive_path(),
            PathBuf::from("/tmp/out/vbm_outputs.tar.gz")
        );
    }

    #[tokio::test]
    async fn test_version_mismatch_aborts() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = RunConfig::default()
            .with_output_dir(temp.path())
            .with_expected_version("12.7771");
        let orchestrator = BatchOrchestrator::new(config, Arc::new(VersionOnly("12.7169")));

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_no_subjects_is_precondition_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = RunConfig::default()
            .with_output_dir(temp.path().join("out"))
            .with_data(DataSource::NiftiList { files: Vec::new() });
        let orchestrator = BatchOrchestrator::new(config, Arc::new(VersionOnly("12.7169")));

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::NoSubjects));
    }

    #[test]
    fn test_check_writable() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(check_writable(&temp.path().join("nested/out")).is_ok());
        assert_eq!(std::fs::read_dir(temp.path().join("nested/out")).unwrap().count(), 0);
    }
}
