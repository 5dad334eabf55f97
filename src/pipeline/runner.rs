//! Per-subject pipeline.
//!
//! The [`SubjectRunner`] drives one subject through
//! `Resolved → Materialized → Preprocessed → Scored → Curated → Done`.
//! Any stage can end the subject in `Failed(stage, reason)`, returned as a
//! [`SubjectError`] so the batch loop can record it and move on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineJob, OutputKey, OutputRole, StageOutputSet, StructuralEngine};
use crate::error::{EngineError, IntakeError, SubjectError, SubjectStage};
use crate::metrics::MetricsCollector;
use crate::quality::{compute_similarity, write_score_file, QcVerdict, QualityGate};
use crate::report::readme::write_readmes;
use crate::subjects::{volume_stem, Subject, SubjectSource};
use crate::volume::{nifti, Volume};

use super::config::{
    DataSource, EngineSettings, QcConfig, RegressionConfig, ResampleSpec, RunConfig,
    SmoothingKernel,
};
use super::workspace::SubjectWorkspace;

/// Per-subject score file.
pub const SCORE_FILENAME: &str = "vbm_corr_value.txt";

/// Rendered preview some engines write next to the normalized grey-matter map.
pub const PREVIEW_IMAGE: &str = "wc1Re.png";

/// Prefix of resampled regression inputs.
const RESAMPLED_PREFIX: &str = "r";

/// Progress of one subject through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Resolved,
    Materialized,
    Preprocessed,
    Scored,
    Curated,
    Done,
}

impl std::fmt::Display for SubjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectState::Resolved => write!(f, "resolved"),
            SubjectState::Materialized => write!(f, "materialized"),
            SubjectState::Preprocessed => write!(f, "preprocessed"),
            SubjectState::Scored => write!(f, "scored"),
            SubjectState::Curated => write!(f, "curated"),
            SubjectState::Done => write!(f, "done"),
        }
    }
}

/// Result of a subject that reached `Done`.
#[derive(Debug, Clone)]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub label: String,
    pub ordinal: usize,
    pub score: f64,
    pub verdict: QcVerdict,
    /// Regression input, relative to the run root.
    pub regression_path: PathBuf,
    /// Normalized grey-matter map, when the engine produced one.
    pub preview: Option<PathBuf>,
    /// Rendered preview image, when the engine produced one.
    pub preview_image: Option<PathBuf>,
    pub duration: Duration,
}

impl SubjectOutcome {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }
}

/// Runs the per-subject stages for one batch.
pub struct SubjectRunner {
    engine: Arc<dyn StructuralEngine>,
    settings: EngineSettings,
    kernel: SmoothingKernel,
    qc: QcConfig,
    regression: RegressionConfig,
    resample: Option<ResampleSpec>,
    reference: Arc<Volume>,
    run_root: PathBuf,
    scratch_root: PathBuf,
    positional_ids: bool,
    metrics: MetricsCollector,
}

impl SubjectRunner {
    /// Creates a runner writing under `run_root`.
    pub fn new(
        config: &RunConfig,
        engine: Arc<dyn StructuralEngine>,
        reference: Arc<Volume>,
        run_root: impl Into<PathBuf>,
    ) -> Self {
        let positional_ids = config.regression.covariates.is_none()
            && matches!(
                config.data,
                DataSource::NiftiList { .. } | DataSource::NiftiPathsFile { .. }
            );
        Self {
            engine,
            settings: config.engine_settings(),
            kernel: config.smoothing,
            qc: config.qc().clone(),
            regression: config.regression().clone(),
            resample: config.resample.clone(),
            reference,
            run_root: run_root.into(),
            scratch_root: std::env::temp_dir(),
            positional_ids,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the directory private scratch areas are created in.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Runs one subject to completion or to its first failure.
    ///
    /// QC failures are not errors: the subject reaches `Done` with a
    /// non-passing verdict. An undefined score flags the subject in `gate`
    /// and fails it at the scoring stage.
    #[instrument(skip(self, subject, gate), fields(subject = %subject.label()))]
    pub async fn run(
        &self,
        subject: &Subject,
        gate: &mut QualityGate,
    ) -> Result<SubjectOutcome, SubjectError> {
        let started = Instant::now();
        let label = subject.label();
        debug!(state = %SubjectState::Resolved, source = %subject.source.path().display());

        let workspace = SubjectWorkspace::create(
            &self.scratch_root,
            self.run_root.join(subject.relative_output_dir()),
        )
        .map_err(|e| SubjectError::new(SubjectStage::Intake, e))?;

        let input = self
            .materialize(subject, workspace.scratch_dir())
            .await
            .map_err(|e| SubjectError::new(SubjectStage::Intake, e))?;
        debug!(state = %SubjectState::Materialized, input = %input.display());

        let job = EngineJob::new(&input, workspace.output_dir(), workspace.scratch_dir());
        let engine_started = Instant::now();
        let outputs = self.engine.preprocess(&job, &self.settings).await;
        self.metrics
            .record_engine_run(engine_started.elapsed().as_secs_f64());
        let outputs = outputs.map_err(|e| SubjectError::new(SubjectStage::Preprocess, e))?;
        debug!(state = %SubjectState::Preprocessed, outputs = outputs.len());

        let score = match self.score(&outputs) {
            Ok(score) => score,
            Err(e) => {
                if e.is_degenerate_score() {
                    gate.evaluate(&label, None);
                }
                return Err(e);
            }
        };
        self.metrics.record_score(score);
        debug!(state = %SubjectState::Scored, score = score);

        let verdict = gate.evaluate(&label, Some(score));
        if !verdict.passed {
            warn!(score = score, threshold = gate.threshold(), "Subject did not pass quality control");
        }

        let regression_file = self.regression_input(&outputs).await?;
        debug!(state = %SubjectState::Curated, regression = %regression_file);

        write_score_file(&workspace.output_dir().join(SCORE_FILENAME), score)
            .map_err(|e| SubjectError::new(SubjectStage::Curation, e))?;
        write_readmes(
            workspace.output_dir(),
            &self.kernel,
            self.positional_ids,
            self.qc.pass_threshold,
            &OutputKey::tissue(OutputRole::Smoothed, self.qc.tissue).file_name(),
        )
        .map_err(|e| SubjectError::new(SubjectStage::Curation, e))?;

        let preview = outputs
            .get(&OutputKey::tissue(OutputRole::Normalized, 1))
            .map(Path::to_path_buf);
        let preview_image = Some(workspace.output_dir().join(PREVIEW_IMAGE)).filter(|p| p.is_file());

        let outcome = SubjectOutcome {
            subject_id: subject.id.clone(),
            label,
            ordinal: subject.ordinal_index,
            score,
            verdict,
            regression_path: subject.relative_output_dir().join(regression_file),
            preview,
            preview_image,
            duration: started.elapsed(),
        };
        info!(
            state = %SubjectState::Done,
            score = outcome.score,
            passed = outcome.passed(),
            duration_secs = outcome.duration.as_secs_f64(),
            "Subject processed"
        );
        Ok(outcome)
    }

    /// Copies or converts the source scan into the subject's anat directory.
    async fn materialize(&self, subject: &Subject, scratch: &Path) -> Result<PathBuf, IntakeError> {
        let anat_dir = self.run_root.join(subject.relative_anat_dir());
        std::fs::create_dir_all(&anat_dir)?;

        let dest = match &subject.source {
            SubjectSource::Volume(path) => {
                if !path.is_file() {
                    return Err(IntakeError::Missing(path.display().to_string()));
                }
                let stem = volume_stem(path).ok_or_else(|| IntakeError::Unsupported {
                    path: path.display().to_string(),
                    reason: "file name has no stem".to_string(),
                })?;
                let dest = anat_dir.join(format!("{}.nii", stem));
                nifti::copy_uncompressed(path, &dest).map_err(|e| IntakeError::Unreadable {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                dest
            }
            SubjectSource::Series(dir) => {
                if !dir.is_dir() {
                    return Err(IntakeError::Missing(dir.display().to_string()));
                }
                let converted = self.engine.import_series(dir, scratch).await.map_err(|e| {
                    IntakeError::SeriesConversion {
                        path: dir.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let dest = anat_dir.join(format!("{}.nii", subject.id));
                nifti::copy_uncompressed(&converted, &dest).map_err(|e| {
                    IntakeError::SeriesConversion {
                        path: dir.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                dest
            }
        };

        // Reject anything the engine could not read before spending hours on it
        if let Err(e) = nifti::probe(&dest) {
            let _ = std::fs::remove_file(&dest);
            return Err(IntakeError::Unsupported {
                path: subject.source.path().display().to_string(),
                reason: e.to_string(),
            });
        }
        Ok(dest)
    }

    fn score(&self, outputs: &StageOutputSet) -> Result<f64, SubjectError> {
        let key = OutputKey::tissue(OutputRole::Smoothed, self.qc.tissue);
        let path = outputs.get(&key).ok_or_else(|| {
            SubjectError::new(
                SubjectStage::Scoring,
                EngineError::IncompleteOutput {
                    missing: vec![key.file_name()],
                },
            )
        })?;
        let candidate =
            Volume::open(path).map_err(|e| SubjectError::new(SubjectStage::Scoring, e))?;
        compute_similarity(&self.reference, &candidate)
            .map_err(|e| SubjectError::new(SubjectStage::Scoring, e))
    }

    /// File name of the regression input inside the subject's output directory.
    async fn regression_input(&self, outputs: &StageOutputSet) -> Result<String, SubjectError> {
        let key = OutputKey::tissue(self.regression.input_role, self.regression.input_tissue);
        let path = outputs.get(&key).ok_or_else(|| {
            SubjectError::new(
                SubjectStage::Curation,
                EngineError::IncompleteOutput {
                    missing: vec![key.file_name()],
                },
            )
        })?;

        let Some(spec) = &self.resample else {
            return Ok(key.file_name());
        };

        let file_name = format!("{}{}", RESAMPLED_PREFIX, key.file_name());
        let output = outputs.dir().join(&file_name);
        self.engine
            .resample(path, &output, spec)
            .await
            .map_err(|e| SubjectError::new(SubjectStage::Resampling, e))?;
        if !output.is_file() {
            return Err(SubjectError::new(
                SubjectStage::Resampling,
                EngineError::IncompleteOutput {
                    missing: vec![file_name],
                },
            ));
        }
        Ok(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::expected_outputs;
    use crate::error::SubjectFailure;
    use crate::subjects::resolve_list;
    use async_trait::async_trait;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn blob(offset: f64) -> Volume {
        Volume::new(Array3::from_shape_fn((6, 6, 6), |(x, y, z)| {
            if (1..5).contains(&x) && (1..5).contains(&y) && (1..5).contains(&z) {
                (x * 7 + y * 3 + z) as f64 + offset
            } else {
                0.0
            }
        }))
    }

    /// Writes every expected output as a copy of a fixed volume.
    struct FixedEngine {
        output: Volume,
        fail: bool,
    }

    #[async_trait]
    impl StructuralEngine for FixedEngine {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn version(&self) -> Result<String, EngineError> {
            Ok("test".to_string())
        }

        async fn run_preprocess(
            &self,
            job: &EngineJob,
            settings: &EngineSettings,
        ) -> Result<(), EngineError> {
            if self.fail {
                return Err(EngineError::NonZeroExit {
                    code: 1,
                    stderr: "segmentation failed".to_string(),
                });
            }
            std::fs::write(job.output_dir.join("crash-1.pklz"), b"x")?;
            for key in expected_outputs(settings) {
                self.output
                    .save(job.output_dir.join(key.file_name()))
                    .map_err(|e| EngineError::Unsupported(e.to_string()))?;
            }
            Ok(())
        }
    }

    fn setup(engine: FixedEngine, threshold: f64) -> (TempDir, SubjectRunner, Vec<Subject>) {
        let temp = TempDir::new().unwrap();
        let scan = temp.path().join("scan.nii.gz");
        blob(0.0).save(&scan).unwrap();
        let config = RunConfig::default()
            .with_data(DataSource::NiftiList {
                files: vec![scan.clone()],
            })
            .with_output_dir(temp.path().join("out"))
            .with_pass_threshold(threshold);
        let runner = SubjectRunner::new(
            &config,
            Arc::new(engine),
            Arc::new(blob(0.0)),
            temp.path().join("out/vbm_outputs"),
        )
        .with_scratch_root(temp.path().join("scratch"));
        let subjects = resolve_list(&[scan]);
        (temp, runner, subjects)
    }

    #[tokio::test]
    async fn test_subject_reaches_done() {
        let engine = FixedEngine {
            output: blob(0.0),
            fail: false,
        };
        let (_temp, runner, subjects) = setup(engine, 0.9);
        let mut gate = QualityGate::new(0.9);

        let outcome = runner.run(&subjects[0], &mut gate).await.unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.regression_path, PathBuf::from("sub-1/anat/vbm_spm12/swc1Re.nii"));

        let out_dir = runner.run_root().join("sub-1/anat/vbm_spm12");
        assert_eq!(
            std::fs::read_to_string(out_dir.join(SCORE_FILENAME)).unwrap(),
            "1.00\n"
        );
        assert!(out_dir.join("outputs_description.txt").is_file());
        assert!(!out_dir.join("crash-1.pklz").exists());
        assert!(runner.run_root().join("sub-1/anat/scan.nii").is_file());
        assert!(gate.flagged().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_is_preprocess_stage() {
        let engine = FixedEngine {
            output: blob(0.0),
            fail: true,
        };
        let (_temp, runner, subjects) = setup(engine, 0.9);
        let mut gate = QualityGate::new(0.9);

        let err = runner.run(&subjects[0], &mut gate).await.unwrap_err();
        assert_eq!(err.stage, SubjectStage::Preprocess);
        assert!(matches!(err.source, SubjectFailure::Engine(_)));
        assert!(gate.flagged().is_empty());
    }

    #[tokio::test]
    async fn test_degenerate_score_flags_subject() {
        let engine = FixedEngine {
            output: Volume::new(Array3::zeros((6, 6, 6))),
            fail: false,
        };
        let (_temp, runner, subjects) = setup(engine, 0.9);
        let mut gate = QualityGate::new(0.9);

        let err = runner.run(&subjects[0], &mut gate).await.unwrap_err();
        assert_eq!(err.stage, SubjectStage::Scoring);
        assert!(err.is_degenerate_score());
        assert_eq!(gate.flagged(), &["sub-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_source_is_intake_failure() {
        let engine = FixedEngine {
            output: blob(0.0),
            fail: false,
        };
        let (temp, runner, _) = setup(engine, 0.9);
        let subjects = resolve_list(&[temp.path().join("absent.nii")]);
        let mut gate = QualityGate::new(0.9);

        let err = runner.run(&subjects[0], &mut gate).await.unwrap_err();
        assert_eq!(err.stage, SubjectStage::Intake);
    }

    #[tokio::test]
    async fn test_resampling_unsupported_fails_subject() {
        let engine = FixedEngine {
            output: blob(0.0),
            fail: false,
        };
        let (_temp, mut runner, subjects) = setup(engine, 0.9);
        runner.resample = Some(ResampleSpec {
            voxel_size: [2.0, 2.0, 2.0],
            method: crate::pipeline::config::Interpolation::Trilinear,
        });
        let mut gate = QualityGate::new(0.9);

        let err = runner.run(&subjects[0], &mut gate).await.unwrap_err();
        assert_eq!(err.stage, SubjectStage::Resampling);
    }
}
