//! Run aggregation and the final payload.
//!
//! [`RunSummary`] accumulates per-subject outcomes during the loop;
//! [`RunAggregator::finalize`] turns it, together with the curated
//! manifest, into the [`RunPayload`] returned to the caller.

pub mod archive;
pub mod readme;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::manifest::ManifestCurator;
use crate::pipeline::config::ReportingConfig;
use crate::quality::QcVerdict;

pub use archive::{create_archive, sha256_file, ArchiveInfo};

/// Appended to the message when the success or QC pass rate is low.
pub const LOW_RATE_WARNING: &str = "WARNING: half or fewer of the subjects passed preprocessing or quality control. \
Review the error log and QA_flagged_subjects.txt before running downstream statistics.";

/// Pointer to the readme files written next to each subject's outputs.
pub const OUTPUTS_INFO: &str = "Please read outputs_description.txt for a description of the pre-processed \
output files and quality_control_readme.txt for the quality control measurement. \
These files are placed under the pre-processed data.";

/// Message returned when the output directory cannot be written.
pub const UNWRITABLE_MESSAGE: &str = "Can not write to target directory";

/// Run-level statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_subjects: usize,
    pub succeeded: usize,
    pub qc_passed: usize,
    /// Subject label to failure message.
    pub error_log: BTreeMap<String, String>,
    /// Flagged subject ids, ordered and unique.
    pub qc_flagged: Vec<String>,
    pub archive_path: Option<PathBuf>,
    pub archive_sha256: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, total_subjects: usize) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            total_subjects,
            succeeded: 0,
            qc_passed: 0,
            error_log: BTreeMap::new(),
            qc_flagged: Vec::new(),
            archive_path: None,
            archive_sha256: None,
        }
    }

    /// Records a subject that reached the end of the pipeline.
    pub fn record_success(&mut self, verdict: &QcVerdict) {
        self.succeeded += 1;
        if verdict.passed {
            self.qc_passed += 1;
        }
    }

    /// Records a failed subject.
    pub fn record_failure(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.error_log.insert(subject.into(), message.into());
    }

    pub fn failed(&self) -> usize {
        self.error_log.len()
    }

    /// `succeeded / total`, or 0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        ratio(self.succeeded, self.total_subjects)
    }

    /// `qc_passed / total`, or 0 for an empty run.
    pub fn qc_pass_rate(&self) -> f64 {
        ratio(self.qc_passed, self.total_subjects)
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Writes the summary as pretty JSON.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// `output` section of the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadOutput {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_outputs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariates: Option<Vec<Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<String>>,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub output: PayloadOutput,
    /// True whenever the run reached completion, regardless of subject outcomes.
    pub success: bool,
}

impl RunPayload {
    /// Payload carrying only a message.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            output: PayloadOutput {
                message: message.into(),
                ..PayloadOutput::default()
            },
            success: true,
        }
    }

    /// Builder method to attach a base64 preview image.
    pub fn with_display(mut self, display: Option<String>) -> Self {
        self.output.display = display;
        self
    }

    /// Whether the payload carries the regression manifest.
    pub fn has_manifest(&self) -> bool {
        self.output.data.is_some()
    }
}

/// Builds the final payload from the run summary.
#[derive(Debug, Clone)]
pub struct RunAggregator {
    reporting: ReportingConfig,
}

impl RunAggregator {
    pub fn new(reporting: ReportingConfig) -> Self {
        Self { reporting }
    }

    /// Whether a warning is appended for the given summary.
    pub fn needs_warning(&self, summary: &RunSummary) -> bool {
        summary.success_rate() <= self.reporting.warning_threshold
            || summary.qc_pass_rate() <= self.reporting.warning_threshold
    }

    /// Whether the manifest is included for the given summary.
    pub fn includes_manifest(&self, summary: &RunSummary) -> bool {
        summary.succeeded > 0 && summary.success_rate() > self.reporting.inclusion_threshold
    }

    /// Builds the payload.
    pub fn finalize(&self, summary: &RunSummary, manifest: &ManifestCurator) -> RunPayload {
        let mut message = if summary.succeeded == 0 {
            format!(
                "VBM preprocessing failed for all subjects (0/{}). No outputs were produced for downstream analysis.",
                summary.total_subjects
            )
        } else {
            format!(
                "VBM preprocessing completed for {}/{} subjects ({:.0}%); {} passed quality control. {}",
                summary.succeeded,
                summary.total_subjects,
                summary.success_rate() * 100.0,
                summary.qc_passed,
                OUTPUTS_INFO
            )
        };

        if self.needs_warning(summary) {
            message.push('\n');
            message.push_str(LOW_RATE_WARNING);
        }

        if !summary.error_log.is_empty() {
            message.push_str("\nErrors:");
            for (subject, error) in &summary.error_log {
                message.push_str(&format!("\n  {}: {}", subject, error));
            }
        }

        let mut output = PayloadOutput {
            message,
            download_outputs: summary
                .archive_path
                .as_ref()
                .map(|p| p.display().to_string()),
            ..PayloadOutput::default()
        };

        if self.includes_manifest(summary) {
            output.data = Some(manifest.regression_files());
            if manifest.has_covariates() {
                output.covariates = Some(manifest.covariates());
            }
        }

        RunPayload {
            output,
            success: true,
        }
    }
}
