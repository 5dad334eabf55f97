//! Subject resolution.
//!
//! Turns a [`DataSource`] into an ordered list of [`Subject`] records with
//! stable identifiers. The position of each subject in the returned list
//! is its ordinal, the join key between covariates and regression files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::IntakeError;
use crate::pipeline::config::{DataSource, SUBJECT_OUTPUT_DIR};

/// Where a subject's scan comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum SubjectSource {
    /// A NIfTI volume, optionally gzip-compressed.
    Volume(PathBuf),
    /// A directory of device-native images to convert first.
    Series(PathBuf),
}

impl SubjectSource {
    pub fn path(&self) -> &Path {
        match self {
            SubjectSource::Volume(p) | SubjectSource::Series(p) => p,
        }
    }
}

/// One scan to process. Immutable after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: String,
    pub session: Option<String>,
    pub source: SubjectSource,
    pub ordinal_index: usize,
}

impl Subject {
    /// `<id>/[<session>/]anat`, relative to the run root.
    pub fn relative_anat_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(&self.id);
        if let Some(session) = &self.session {
            dir.push(session);
        }
        dir.push("anat");
        dir
    }

    /// `<id>/[<session>/]anat/vbm_spm12`, relative to the run root.
    pub fn relative_output_dir(&self) -> PathBuf {
        self.relative_anat_dir().join(SUBJECT_OUTPUT_DIR)
    }

    /// Label used in logs and the error log: `sub-01` or `sub-01/ses-1`.
    pub fn label(&self) -> String {
        match &self.session {
            Some(session) => format!("{}/{}", self.id, session),
            None => self.id.clone(),
        }
    }
}

/// Resolves subjects from a data source.
///
/// # Errors
///
/// Returns `IntakeError` when the source locator itself is unusable
/// (missing BIDS root, unreadable paths file). Individual scans are not
/// opened here; bad scans fail later, per subject.
pub fn resolve(source: &DataSource) -> Result<Vec<Subject>, IntakeError> {
    let subjects = match source {
        DataSource::Bids { root, scan_type } => resolve_bids(root, scan_type)?,
        DataSource::NiftiList { files } => resolve_list(files),
        DataSource::NiftiPathsFile { path } => resolve_list(&read_paths_file(path)?),
        DataSource::DeviceSeries { directories } => resolve_series(directories),
    };
    debug!(count = subjects.len(), "Resolved subjects");
    Ok(subjects)
}

/// Discovers `sub-*/[ses-*/]anat/*_<scan_type>.nii[.gz]` under `root`, sorted by path.
pub fn resolve_bids(root: &Path, scan_type: &str) -> Result<Vec<Subject>, IntakeError> {
    if !root.is_dir() {
        return Err(IntakeError::Missing(root.display().to_string()));
    }

    let pattern = format!(
        r"^(sub-[A-Za-z0-9]+)/(?:(ses-[A-Za-z0-9]+)/)?anat/[^/]*_{}\.nii(?:\.gz)?$",
        regex::escape(scan_type)
    );
    let re = Regex::new(&pattern).map_err(|e| IntakeError::Unsupported {
        path: root.display().to_string(),
        reason: format!("invalid scan type '{}': {}", scan_type, e),
    })?;

    let mut subjects = Vec::new();
    let mut seen: HashSet<(String, Option<String>)> = HashSet::new();

    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(4)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let Some(caps) = re.captures(&relative) else {
            continue;
        };

        let id = caps[1].to_string();
        let session = caps.get(2).map(|m| m.as_str().to_string());
        if !seen.insert((id.clone(), session.clone())) {
            warn!(
                subject = %id,
                file = %relative,
                "Skipping additional scan for an already resolved subject"
            );
            continue;
        }

        subjects.push(Subject {
            id,
            session,
            source: SubjectSource::Volume(entry.into_path()),
            ordinal_index: subjects.len(),
        });
    }

    Ok(subjects)
}

/// Names an explicit file list `sub-1..sub-N` in input order.
pub fn resolve_list(files: &[PathBuf]) -> Vec<Subject> {
    files
        .iter()
        .enumerate()
        .map(|(i, path)| Subject {
            id: format!("sub-{}", i + 1),
            session: None,
            source: SubjectSource::Volume(path.clone()),
            ordinal_index: i,
        })
        .collect()
}

/// One subject per device series directory, named after the directory.
pub fn resolve_series(directories: &[PathBuf]) -> Vec<Subject> {
    let ids = directories
        .iter()
        .enumerate()
        .map(|(i, dir)| {
            dir.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("sub-{}", i + 1))
        })
        .collect();
    unique_ids(ids)
        .into_iter()
        .zip(directories)
        .enumerate()
        .map(|(i, (id, dir))| Subject {
            id,
            session: None,
            source: SubjectSource::Series(dir.clone()),
            ordinal_index: i,
        })
        .collect()
}

/// One subject per covariate row, named after the scan's file stem.
pub fn resolve_covariate_files(files: &[PathBuf]) -> Vec<Subject> {
    let ids = files
        .iter()
        .enumerate()
        .map(|(i, path)| volume_stem(path).unwrap_or_else(|| format!("sub-{}", i + 1)))
        .collect();
    unique_ids(ids)
        .into_iter()
        .zip(files)
        .enumerate()
        .map(|(i, (id, path))| Subject {
            id,
            session: None,
            source: SubjectSource::Volume(path.clone()),
            ordinal_index: i,
        })
        .collect()
}

/// Suffixes repeated ids with `-2`, `-3`, ... in input order.
///
/// The first occurrence keeps its name; a suffix never reuses an id that
/// appears elsewhere in the list.
fn unique_ids(ids: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = ids.iter().cloned().collect();
    let mut seen: HashSet<String> = HashSet::new();

    ids.into_iter()
        .map(|id| {
            if seen.insert(id.clone()) {
                return id;
            }
            let renamed = (2..)
                .map(|n| format!("{}-{}", id, n))
                .find(|candidate| !taken.contains(candidate))
                .unwrap_or_else(|| id.clone());
            warn!(subject = %id, renamed = %renamed, "Renaming subject with a duplicate id");
            taken.insert(renamed.clone());
            seen.insert(renamed.clone());
            renamed
        })
        .collect()
}

/// File name without `.nii` / `.nii.gz`.
pub fn volume_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let name = name.strip_suffix(".nii").unwrap_or(name);
    (!name.is_empty()).then(|| name.to_string())
}

/// Reads a text file listing one volume path per line.
///
/// Blank lines and lines starting with `#` are ignored; a trailing comma
/// (single-column CSV) is tolerated. Relative paths resolve against the
/// file's directory.
pub fn read_paths_file(path: &Path) -> Result<Vec<PathBuf>, IntakeError> {
    let content = std::fs::read_to_string(path).map_err(|e| IntakeError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    Ok(content
        .lines()
        .map(|l| l.trim().trim_end_matches(',').trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            let p = PathBuf::from(l);
            if p.is_absolute() {
                p
            } else {
                base.join(p)
            }
        })
        .collect())
}
