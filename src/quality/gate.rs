//! Threshold gate deciding which subjects feed the regression manifest.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::config::QcConfig;

/// Name of the run-scoped flagged-subjects record.
pub const FLAGGED_FILENAME: &str = "QA_flagged_subjects.txt";

/// Outcome of the QC gate for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcVerdict {
    pub subject_id: String,
    /// Raw similarity; `None` when scoring failed.
    pub score: Option<f64>,
    pub passed: bool,
}

impl fmt::Display for QcVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "passed" } else { "flagged" };
        match self.score {
            Some(score) => write!(f, "{} {} ({:.2})", self.subject_id, status, score),
            None => write!(f, "{} {} (no score)", self.subject_id, status),
        }
    }
}

/// Rounds a score to two decimals, the precision the threshold applies at.
///
/// The value is read back from the same two-decimal text the score file
/// carries, so ties at `.xx5` resolve identically in both places.
pub fn round_score(score: f64) -> f64 {
    format!("{:.2}", score).parse().unwrap_or(score)
}

/// Pure threshold decision.
pub fn evaluate(subject_id: &str, score: Option<f64>, threshold: f64) -> QcVerdict {
    let passed = score
        .map(|s| s.is_finite() && round_score(s) >= threshold)
        .unwrap_or(false);
    QcVerdict {
        subject_id: subject_id.to_string(),
        score,
        passed,
    }
}

/// Stateful gate that tracks flagged subjects for one run.
#[derive(Debug, Clone)]
pub struct QualityGate {
    threshold: f64,
    flagged: Vec<String>,
    seen: HashSet<String>,
    passed: usize,
}

impl QualityGate {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            flagged: Vec::new(),
            seen: HashSet::new(),
            passed: 0,
        }
    }

    pub fn from_config(qc: &QcConfig) -> Self {
        Self::new(qc.pass_threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Evaluates a subject, recording it in the flagged list when it does not pass.
    pub fn evaluate(&mut self, subject_id: &str, score: Option<f64>) -> QcVerdict {
        let verdict = evaluate(subject_id, score, self.threshold);
        if verdict.passed {
            self.passed += 1;
        } else {
            self.flag(subject_id);
        }
        verdict
    }

    /// Appends a subject to the flagged record once.
    pub fn flag(&mut self, subject_id: &str) {
        if self.seen.insert(subject_id.to_string()) {
            self.flagged.push(subject_id.to_string());
        }
    }

    /// Flagged subject ids in first-flagged order.
    pub fn flagged(&self) -> &[String] {
        &self.flagged
    }

    pub fn passed_count(&self) -> usize {
        self.passed
    }

    /// Writes the flagged record, one subject id per line.
    pub fn write_flagged(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        for id in &self.flagged {
            writeln!(file, "{}", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_rounds_before_comparing() {
        assert!(evaluate("sub-1", Some(0.896), 0.90).passed);
        assert!(!evaluate("sub-1", Some(0.894), 0.90).passed);
        assert!(evaluate("sub-1", Some(0.90), 0.90).passed);
    }

    #[test]
    fn test_rounding_agrees_with_score_file() {
        use crate::quality::similarity::format_score;

        for s in [0.125, 0.135, 0.895, 0.905, 0.915, 0.8950000001, 0.99999, 1.0] {
            let written: f64 = format_score(s).trim().parse().unwrap();
            assert_eq!(round_score(s), written, "score {}", s);
            assert_eq!(
                evaluate("sub-1", Some(s), 0.90).passed,
                written >= 0.90,
                "score {}",
                s
            );
        }
    }

    #[test]
    fn test_missing_score_never_passes() {
        let verdict = evaluate("sub-2", None, 0.0);
        assert!(!verdict.passed);
        assert_eq!(verdict.to_string(), "sub-2 flagged (no score)");
    }

    #[test]
    fn test_gate_matches_pure_decision() {
        let mut gate = QualityGate::new(0.91);
        for (i, s) in [0.95, 0.905, 0.85, 0.91, 0.5].iter().enumerate() {
            let id = format!("sub-{}", i + 1);
            assert_eq!(gate.evaluate(&id, Some(*s)).passed, round_score(*s) >= 0.91);
        }
    }

    #[test]
    fn test_flagged_unique_and_ordered() {
        let mut gate = QualityGate::new(0.9);
        gate.evaluate("sub-3", Some(0.2));
        gate.evaluate("sub-1", None);
        gate.flag("sub-3");
        gate.evaluate("sub-2", Some(0.99));

        assert_eq!(gate.flagged(), &["sub-3".to_string(), "sub-1".to_string()]);
        assert_eq!(gate.passed_count(), 1);
    }

    #[test]
    fn test_write_flagged() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(FLAGGED_FILENAME);
        let mut gate = QualityGate::from_config(&QcConfig::default());
        gate.evaluate("sub-7", Some(0.1));
        gate.evaluate("sub-9", None);
        gate.write_flagged(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sub-7\nsub-9\n");
    }
}
