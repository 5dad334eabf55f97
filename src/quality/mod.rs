//! Quality control for preprocessed scans.
//!
//! A similarity score against a reference template is computed per subject
//! and thresholded by the gate, which decides regression inclusion.

pub mod gate;
pub mod similarity;

pub use gate::{evaluate, round_score, QcVerdict, QualityGate, FLAGGED_FILENAME};
pub use similarity::{compute as compute_similarity, format_score, write_score_file};
