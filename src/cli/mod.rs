//! Command-line interface for vbm_forge.
//!
//! Provides commands for batch preprocessing, single-pair similarity
//! scoring and configuration checks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
