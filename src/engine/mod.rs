//! Structural preprocessing engine seam.
//!
//! The engine turns one input volume into a fixed set of named output
//! volumes (reoriented image, tissue maps in native and template space,
//! modulated and smoothed variants). Its internals are opaque; the
//! orchestrator only relies on:
//! 1. The filenames described in [`outputs`]
//! 2. A bounded run time
//! 3. A version string for the pre-flight check

pub mod command;
pub mod outputs;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::EngineError;

pub use crate::pipeline::config::{EngineSettings, ResampleSpec};
pub use command::CommandEngine;
pub use outputs::{expected_outputs, OutputKey, OutputRole, StageOutputSet};

/// One preprocessing job.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Materialized input volume (uncompressed `.nii`).
    pub input: PathBuf,
    /// Directory the engine must write its named outputs into.
    pub output_dir: PathBuf,
    /// Private scratch directory, deleted after the job.
    pub scratch_dir: PathBuf,
}

impl EngineJob {
    pub fn new(
        input: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            scratch_dir: scratch_dir.into(),
        }
    }
}

/// Trait for structural preprocessing engines.
#[async_trait]
pub trait StructuralEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns the engine version string.
    async fn version(&self) -> Result<String, EngineError>;

    /// Runs the preprocessing stages, writing outputs into `job.output_dir`.
    ///
    /// Implementations do not need to report what they wrote; outputs are
    /// located by filename afterwards.
    async fn run_preprocess(
        &self,
        job: &EngineJob,
        settings: &EngineSettings,
    ) -> Result<(), EngineError>;

    /// Converts a directory of device-native images into one volume under `dest_dir`.
    async fn import_series(&self, series_dir: &Path, dest_dir: &Path) -> Result<PathBuf, EngineError> {
        let _ = (series_dir, dest_dir);
        Err(EngineError::Unsupported("device series import".to_string()))
    }

    /// Resamples `input` to the requested voxel size, writing `output`.
    async fn resample(
        &self,
        input: &Path,
        output: &Path,
        spec: &ResampleSpec,
    ) -> Result<(), EngineError> {
        let _ = (input, output, spec);
        Err(EngineError::Unsupported("resampling".to_string()))
    }

    /// Runs preprocessing under the configured timeout and locates the outputs.
    ///
    /// Expected outputs left in `job.output_dir` by an earlier run are removed
    /// first, so only files written by this invocation are located.
    ///
    /// On timeout the in-flight job future is dropped, which kills any child
    /// process spawned with `kill_on_drop`.
    async fn preprocess(
        &self,
        job: &EngineJob,
        settings: &EngineSettings,
    ) -> Result<StageOutputSet, EngineError> {
        let expected = expected_outputs(settings);
        let stale = StageOutputSet::clear(&job.output_dir, &expected)?;
        if stale > 0 {
            debug!(
                engine = self.name(),
                dir = %job.output_dir.display(),
                stale,
                "Removed outputs from a previous run"
            );
        }

        match tokio::time::timeout(settings.timeout, self.run_preprocess(job, settings)).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::Timeout(settings.timeout)),
        }

        debug!(
            engine = self.name(),
            dir = %job.output_dir.display(),
            expected = expected.len(),
            "Locating engine outputs"
        );
        StageOutputSet::locate(&job.output_dir, &expected)
    }
}
