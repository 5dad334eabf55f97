//! Regression manifest curation.
//!
//! The manifest is a single ordinal-keyed collection. The covariates table
//! and the regression file list handed downstream are projections of it,
//! so removing a subject can never leave the two out of step.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{IntakeError, ManifestInconsistencyError};
use crate::subjects::Subject;

/// One subject's row in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub ordinal: usize,
    pub subject_id: String,
    /// Source scan before curation; the processed file's run-relative path after.
    pub file_path: String,
    pub covariates: Vec<Value>,
}

/// Covariates loaded from a JSON table.
///
/// The table is an array of arrays: a header row (`["filename", <columns>..]`)
/// followed by one row per scan whose first cell is the scan path.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariatesTable {
    /// Covariate column names, without the leading file column.
    pub header: Vec<String>,
    pub files: Vec<PathBuf>,
    pub rows: Vec<Vec<Value>>,
}

impl CovariatesTable {
    /// Loads a covariates table. Relative file paths resolve against `base_dir`.
    pub fn load(path: &Path, base_dir: Option<&Path>) -> Result<Self, IntakeError> {
        let content = std::fs::read_to_string(path).map_err(|e| IntakeError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let table: Vec<Vec<Value>> =
            serde_json::from_str(&content).map_err(|e| IntakeError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let base = base_dir
            .map(Path::to_path_buf)
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        Self::from_rows(table, &base).map_err(|reason| IntakeError::Unsupported {
            path: path.display().to_string(),
            reason,
        })
    }

    fn from_rows(table: Vec<Vec<Value>>, base: &Path) -> Result<Self, String> {
        let mut rows = table.into_iter();
        let header_row = rows.next().ok_or("covariates table is empty")?;
        if header_row.is_empty() {
            return Err("covariates header row is empty".to_string());
        }
        let header: Vec<String> = header_row.iter().skip(1).map(cell_text).collect();

        let mut files = Vec::new();
        let mut values = Vec::new();
        for (i, row) in rows.enumerate() {
            let mut cells = row.into_iter();
            let file = match cells.next() {
                Some(Value::String(s)) if !s.is_empty() => PathBuf::from(s),
                _ => return Err(format!("row {} has no file path in its first column", i + 1)),
            };
            files.push(if file.is_absolute() { file } else { base.join(file) });
            values.push(cells.collect());
        }

        Ok(Self {
            header,
            files,
            rows: values,
        })
    }
}

/// Curates the manifest over a run.
#[derive(Debug, Clone, Default)]
pub struct ManifestCurator {
    header: Vec<String>,
    has_covariates: bool,
    entries: Vec<ManifestEntry>,
}

impl ManifestCurator {
    /// Manifest without covariates: one entry per subject.
    pub fn from_subjects(subjects: &[Subject]) -> Self {
        let entries = subjects
            .iter()
            .map(|s| ManifestEntry {
                ordinal: s.ordinal_index,
                subject_id: s.id.clone(),
                file_path: s.source.path().display().to_string(),
                covariates: Vec::new(),
            })
            .collect();
        Self {
            header: Vec::new(),
            has_covariates: false,
            entries,
        }
    }

    /// Manifest joining a covariates table with the subjects resolved from it.
    pub fn with_covariates(
        table: CovariatesTable,
        subjects: &[Subject],
    ) -> Result<Self, ManifestInconsistencyError> {
        if table.rows.len() != subjects.len() {
            return Err(ManifestInconsistencyError::SubjectCountMismatch {
                rows: table.rows.len(),
                subjects: subjects.len(),
            });
        }

        let entries = subjects
            .iter()
            .zip(table.rows)
            .map(|(s, covariates)| ManifestEntry {
                ordinal: s.ordinal_index,
                subject_id: s.id.clone(),
                file_path: s.source.path().display().to_string(),
                covariates,
            })
            .collect();
        let curator = Self {
            header: table.header,
            has_covariates: true,
            entries,
        };
        curator.verify()?;
        Ok(curator)
    }

    /// Removes the entry with `ordinal`.
    pub fn remove(&mut self, ordinal: usize) -> Result<ManifestEntry, ManifestInconsistencyError> {
        let position = self.position(ordinal)?;
        let entry = self.entries.remove(position);
        debug!(ordinal, subject = %entry.subject_id, "Removed from manifest");
        Ok(entry)
    }

    /// Rewrites a surviving entry's file path.
    pub fn replace_path(
        &mut self,
        ordinal: usize,
        new_path: impl Into<String>,
    ) -> Result<(), ManifestInconsistencyError> {
        let position = self.position(ordinal)?;
        self.entries[position].file_path = new_path.into();
        Ok(())
    }

    fn position(&self, ordinal: usize) -> Result<usize, ManifestInconsistencyError> {
        self.entries
            .binary_search_by_key(&ordinal, |e| e.ordinal)
            .map_err(|_| ManifestInconsistencyError::UnknownOrdinal(ordinal))
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.position(ordinal).is_ok()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a covariates table was supplied.
    pub fn has_covariates(&self) -> bool {
        self.has_covariates
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Header row followed by one covariate row per surviving entry.
    pub fn covariates(&self) -> Vec<Vec<Value>> {
        let header = self.header.iter().cloned().map(Value::String).collect();
        std::iter::once(header)
            .chain(self.entries.iter().map(|e| e.covariates.clone()))
            .collect()
    }

    /// File paths of surviving entries, in ordinal order.
    pub fn regression_files(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.file_path.clone()).collect()
    }

    /// Checks ordering, row widths and projection lengths.
    pub fn verify(&self) -> Result<(), ManifestInconsistencyError> {
        for (position, pair) in self.entries.windows(2).enumerate() {
            if pair[1].ordinal <= pair[0].ordinal {
                return Err(ManifestInconsistencyError::OutOfOrder {
                    position: position + 1,
                    previous: pair[0].ordinal,
                    current: pair[1].ordinal,
                });
            }
        }

        if self.has_covariates {
            for entry in &self.entries {
                if entry.covariates.len() != self.header.len() {
                    return Err(ManifestInconsistencyError::RowWidth {
                        ordinal: entry.ordinal,
                        expected: self.header.len(),
                        actual: entry.covariates.len(),
                    });
                }
            }
        }

        // the header row is the only offset between the two projections
        let covariate_rows = self.covariates().len() - 1;
        let files = self.regression_files().len();
        if covariate_rows != files {
            return Err(ManifestInconsistencyError::LengthMismatch {
                covariates: covariate_rows,
                files,
            });
        }
        Ok(())
    }

    /// Writes per-output-type covariate tables and copies of each survivor's file.
    ///
    /// For every type stem (`Re`, `c1Re`, `swc1Re`, ...) this creates
    /// `<dest>/covariates/<type>/` with `<id>-<type>.nii` files and a
    /// `covariates-<type>.txt` table (comma-separated, CRLF rows).
    pub fn export_type_tables(
        &self,
        subjects: &[Subject],
        run_root: &Path,
        dest: &Path,
        type_stems: &[String],
    ) -> std::io::Result<usize> {
        let mut written = 0;
        for stem in type_stems {
            let dir = dest.join("covariates").join(stem);
            std::fs::create_dir_all(&dir)?;
            let mut table = std::fs::File::create(dir.join(format!("covariates-{}.txt", stem)))?;

            let mut header = vec!["filename".to_string()];
            header.extend(self.header.iter().cloned());
            write!(table, "{}\r\n", header.join(", "))?;

            for entry in &self.entries {
                let Some(subject) = subjects.get(entry.ordinal) else {
                    continue;
                };
                let src = run_root
                    .join(subject.relative_output_dir())
                    .join(format!("{}.nii", stem));
                if !src.is_file() {
                    continue;
                }
                let file_name = format!("{}-{}.nii", subject.label().replace('/', "_"), stem);
                std::fs::copy(&src, dir.join(&file_name))?;

                let mut row = vec![file_name];
                row.extend(entry.covariates.iter().map(cell_text));
                write!(table, "{}\r\n", row.join(", "))?;
            }
            written += 1;
        }
        info!(types = written, "Exported per-type covariate tables");
        Ok(written)
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
