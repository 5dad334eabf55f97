//! Batch VBM preprocessing pipeline.
//!
//! # Architecture
//!
//! - **Config**: `RunConfig`, loaded once and immutable during a run
//! - **Runner**: drives one subject through intake, preprocessing, scoring and curation
//! - **Workspace**: scoped per-subject scratch area, swept on drop
//! - **Orchestrator**: the sequential batch loop and everything around it
//!
//! # Pipeline Flow
//!
//! 1. **Pre-flight**: engine version check, output directory writability
//! 2. **Resolution**: subjects from BIDS, a file list, a paths file, device series
//!    or a covariates table
//! 3. **Per subject**: materialize, preprocess, score against the reference
//!    template, apply the QC gate, optionally resample, write readmes
//! 4. **Curation**: failed and non-passing subjects leave the regression manifest
//! 5. **Packaging**: flagged record, run log, covariate tables, archive, summary
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vbm_forge::engine::CommandEngine;
//! use vbm_forge::pipeline::{BatchOrchestrator, RunConfig};
//!
//! let config = RunConfig::load("vbm.yaml")?.with_output_dir("/data/out");
//! let engine = Arc::new(CommandEngine::new(config.engine.clone()));
//! let payload = BatchOrchestrator::new(config, engine).run().await?;
//! println!("{}", payload.output.message);
//! ```

pub mod config;
pub mod orchestrator;
pub mod runner;
pub mod workspace;

// Re-export main types for convenience
pub use config::{ConfigError, DataSource, QcProfile, RunConfig, SmoothingKernel};
pub use orchestrator::{BatchOrchestrator, BatchReport, CancellationFlag, PipelineError};
pub use runner::{SubjectOutcome, SubjectRunner, SubjectState, SCORE_FILENAME};
pub use workspace::SubjectWorkspace;
