//! Output vocabulary of the structural preprocessing engine.
//!
//! The engine writes every output under a fixed filename inside the
//! subject's output directory. The orchestrator never trusts the engine's
//! return value for locations; it locates files by these names.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

use super::EngineSettings;

/// Stem of the reoriented input volume; all tissue maps derive from it.
pub const REORIENTED_STEM: &str = "Re";

/// File extension used for all engine outputs.
pub const OUTPUT_EXTENSION: &str = "nii";

/// Role of an engine output volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRole {
    /// Input volume after applying the reorientation matrix.
    Reoriented,
    /// Tissue map in native space (`c{k}`).
    Native,
    /// Tissue map warped to template space (`wc{k}`).
    Normalized,
    /// Warped and modulated tissue map (`mwc{k}`).
    Modulated,
    /// Smoothed warped tissue map (`swc{k}`).
    Smoothed,
    /// Smoothed modulated tissue map (`smwc{k}`).
    SmoothedModulated,
}

impl OutputRole {
    /// Filename prefix placed before the tissue index.
    pub fn prefix(&self) -> &'static str {
        match self {
            OutputRole::Reoriented => "",
            OutputRole::Native => "c",
            OutputRole::Normalized => "wc",
            OutputRole::Modulated => "mwc",
            OutputRole::Smoothed => "swc",
            OutputRole::SmoothedModulated => "smwc",
        }
    }

    /// Whether this role is produced once per tissue class.
    pub fn is_tissue_map(&self) -> bool {
        !matches!(self, OutputRole::Reoriented)
    }
}

impl fmt::Display for OutputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputRole::Reoriented => "reoriented",
            OutputRole::Native => "native",
            OutputRole::Normalized => "normalized",
            OutputRole::Modulated => "modulated",
            OutputRole::Smoothed => "smoothed",
            OutputRole::SmoothedModulated => "smoothed_modulated",
        };
        write!(f, "{}", name)
    }
}

/// One expected engine output: a role, and a tissue class for tissue maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputKey {
    pub role: OutputRole,
    pub tissue: Option<u8>,
}

impl OutputKey {
    /// Key for the reoriented volume.
    pub fn reoriented() -> Self {
        Self {
            role: OutputRole::Reoriented,
            tissue: None,
        }
    }

    /// Key for a tissue map.
    pub fn tissue(role: OutputRole, tissue: u8) -> Self {
        Self {
            role,
            tissue: Some(tissue),
        }
    }

    /// Output type name, e.g. `Re`, `c1Re`, `swc1Re`.
    pub fn stem(&self) -> String {
        match self.tissue {
            Some(k) if self.role.is_tissue_map() => {
                format!("{}{}{}", self.role.prefix(), k, REORIENTED_STEM)
            }
            _ => REORIENTED_STEM.to_string(),
        }
    }

    /// Filename the engine must produce for this output.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem(), OUTPUT_EXTENSION)
    }
}

/// Returns every output the engine is expected to write for the given settings.
pub fn expected_outputs(settings: &EngineSettings) -> Vec<OutputKey> {
    let mut keys = vec![OutputKey::reoriented()];
    for tissue in &settings.tissues {
        if tissue.save_native {
            keys.push(OutputKey::tissue(OutputRole::Native, tissue.index));
        }
        if tissue.save_normalized {
            keys.push(OutputKey::tissue(OutputRole::Normalized, tissue.index));
            keys.push(OutputKey::tissue(OutputRole::Smoothed, tissue.index));
        }
        if tissue.save_modulated {
            keys.push(OutputKey::tissue(OutputRole::Modulated, tissue.index));
            if settings.smooth_modulated {
                keys.push(OutputKey::tissue(OutputRole::SmoothedModulated, tissue.index));
            }
        }
    }
    keys.sort();
    keys
}

/// Files produced by one engine invocation, keyed by output role.
#[derive(Debug, Clone)]
pub struct StageOutputSet {
    dir: PathBuf,
    files: BTreeMap<OutputKey, PathBuf>,
}

impl StageOutputSet {
    /// Locates every expected output in `dir` by filename.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::IncompleteOutput` naming every missing file.
    pub fn locate(dir: &Path, expected: &[OutputKey]) -> Result<Self, EngineError> {
        let mut files = BTreeMap::new();
        let mut missing = Vec::new();

        for key in expected {
            let path = dir.join(key.file_name());
            if path.is_file() {
                files.insert(*key, path);
            } else {
                missing.push(key.file_name());
            }
        }

        if !missing.is_empty() {
            return Err(EngineError::IncompleteOutput { missing });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    /// Removes any expected output already present in `dir`, returning how
    /// many were removed. A missing directory counts as empty.
    pub fn clear(dir: &Path, expected: &[OutputKey]) -> std::io::Result<usize> {
        let mut removed = 0;
        for key in expected {
            match std::fs::remove_file(dir.join(key.file_name())) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Directory the outputs live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a located output.
    pub fn get(&self, key: &OutputKey) -> Option<&Path> {
        self.files.get(key).map(PathBuf::as_path)
    }

    /// Iterates outputs in role/tissue order.
    pub fn iter(&self) -> impl Iterator<Item = (&OutputKey, &PathBuf)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::RunConfig;
    use tempfile::TempDir;

    #[test]
    fn test_output_file_names() {
        assert_eq!(OutputKey::reoriented().file_name(), "Re.nii");
        assert_eq!(
            OutputKey::tissue(OutputRole::Native, 3).file_name(),
            "c3Re.nii"
        );
        assert_eq!(
            OutputKey::tissue(OutputRole::Smoothed, 1).file_name(),
            "swc1Re.nii"
        );
        assert_eq!(
            OutputKey::tissue(OutputRole::SmoothedModulated, 2).stem(),
            "smwc2Re"
        );
    }

    #[test]
    fn test_expected_outputs_default_settings() {
        let settings = RunConfig::default().engine_settings();
        let keys = expected_outputs(&settings);

        // Re + 6 tissues x (native, normalized, smoothed, modulated)
        assert_eq!(keys.len(), 1 + 6 * 4);
        assert_eq!(keys[0], OutputKey::reoriented());
        assert!(keys.contains(&OutputKey::tissue(OutputRole::Smoothed, 1)));
        assert!(!keys.contains(&OutputKey::tissue(OutputRole::SmoothedModulated, 1)));
    }

    #[test]
    fn test_locate_reports_missing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Re.nii"), b"x").unwrap();

        let expected = vec![
            OutputKey::reoriented(),
            OutputKey::tissue(OutputRole::Smoothed, 1),
        ];
        let err = StageOutputSet::locate(temp.path(), &expected).unwrap_err();
        match err {
            EngineError::IncompleteOutput { missing } => {
                assert_eq!(missing, vec!["swc1Re.nii".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_locate_complete() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("Re.nii"), b"x").unwrap();
        std::fs::write(temp.path().join("swc1Re.nii"), b"x").unwrap();

        let expected = vec![
            OutputKey::reoriented(),
            OutputKey::tissue(OutputRole::Smoothed, 1),
        ];
        let set = StageOutputSet::locate(temp.path(), &expected).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set
            .get(&OutputKey::tissue(OutputRole::Smoothed, 1))
            .unwrap()
            .ends_with("swc1Re.nii"));
    }
}
