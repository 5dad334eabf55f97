//! vbm_forge: batch voxel-based morphometry preprocessing with quality control.
//!
//! This library resolves structural MRI scans into subjects, runs each one
//! through an external preprocessing engine, scores the result against a
//! reference template and curates a regression manifest from the subjects
//! that pass.

pub mod cli;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod subjects;
pub mod volume;

// Re-export commonly used error types
pub use error::{
    DegenerateInputError, EngineError, IntakeError, ManifestInconsistencyError, SubjectError,
    VolumeError,
};
