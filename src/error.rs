//! Error types for vbm-forge operations.
//!
//! Defines the error taxonomy used across the batch engine:
//! - Subject intake (copying / converting a source scan)
//! - Structural preprocessing engine failures
//! - Degenerate similarity inputs
//! - Regression manifest bookkeeping
//! - Volume decoding and archive packaging
//!
//! Intake, engine and degenerate-input errors are per-subject: the runner
//! records them and moves on. A manifest inconsistency is never per-subject
//! and aborts the run.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while materializing a subject's source scan.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Source '{0}' does not exist")]
    Missing(String),

    #[error("Unsupported source container '{path}': {reason}")]
    Unsupported { path: String, reason: String },

    #[error("Failed to read source '{path}': {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Device series conversion failed for '{path}': {reason}")]
    SeriesConversion { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the structural preprocessing engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine command '{0}' could not be started: {1}")]
    Spawn(String, String),

    #[error("Engine exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine output incomplete, missing: {}", missing.join(", "))]
    IncompleteOutput { missing: Vec<String> },

    #[error("Engine does not support {0}")]
    Unsupported(String),

    #[error("Engine version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The similarity score is undefined for the given pair of volumes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DegenerateInputError {
    #[error("Volumes have different voxel counts ({reference} vs {candidate})")]
    ShapeMismatch { reference: usize, candidate: usize },

    #[error("No voxel is non-zero in both volumes")]
    EmptyOverlap,

    #[error("Masked intensities have zero variance")]
    ZeroVariance,
}

/// The covariates table and the regression file list no longer line up.
///
/// Indicates a bookkeeping bug; callers must abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestInconsistencyError {
    #[error("No manifest entry for ordinal {0}")]
    UnknownOrdinal(usize),

    #[error("Manifest ordinals out of order at position {position}: {previous} then {current}")]
    OutOfOrder {
        position: usize,
        previous: usize,
        current: usize,
    },

    #[error("Covariate row for ordinal {ordinal} has {actual} columns, header has {expected}")]
    RowWidth {
        ordinal: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Covariate rows ({covariates}) and regression files ({files}) differ in length")]
    LengthMismatch { covariates: usize, files: usize },

    #[error("Covariates table has {rows} rows but {subjects} subjects were resolved")]
    SubjectCountMismatch { rows: usize, subjects: usize },
}

/// Errors decoding or encoding volume files.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Not a NIfTI-1 file: {0}")]
    InvalidHeader(String),

    #[error("Unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("Unsupported dimensionality {0}, expected 3 or 4")]
    UnsupportedDimensions(i16),

    #[error("Voxel data truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors packaging the run output tree.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Nothing to archive at '{0}'")]
    EmptySource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stage of the per-subject pipeline at which a subject failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStage {
    Intake,
    Preprocess,
    Scoring,
    Resampling,
    Curation,
    Cancelled,
}

impl fmt::Display for SubjectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubjectStage::Intake => "intake",
            SubjectStage::Preprocess => "preprocess",
            SubjectStage::Scoring => "scoring",
            SubjectStage::Resampling => "resampling",
            SubjectStage::Curation => "curation",
            SubjectStage::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Underlying cause of a per-subject failure.
#[derive(Debug, Error)]
pub enum SubjectFailure {
    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Degenerate(#[from] DegenerateInputError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("{0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A per-subject failure: the terminal `Failed(stage, reason)` state.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct SubjectError {
    pub stage: SubjectStage,
    #[source]
    pub source: SubjectFailure,
}

impl SubjectError {
    /// Creates a subject error for the given stage.
    pub fn new(stage: SubjectStage, source: impl Into<SubjectFailure>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    /// Returns true if the failure came from an undefined similarity score.
    pub fn is_degenerate_score(&self) -> bool {
        matches!(self.source, SubjectFailure::Degenerate(_))
    }
}
