//! Scoped per-subject working area.
//!
//! A [`SubjectWorkspace`] owns a private scratch directory and knows the
//! subject's output directory. Dropping it deletes the scratch directory
//! and sweeps engine leftovers (crash dumps, temp files, batch scripts,
//! workflow directories) out of the output directory, on every exit path.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::engine::command::BATCH_SCRIPT;

/// Directory some engines leave behind for their internal workflow.
pub const WORKFLOW_DIR: &str = "vbm_preprocess";

/// File name prefixes treated as engine scratch.
const SCRATCH_PREFIXES: &[&str] = &["crash", "tmp", "pyscript"];

/// Working area for one subject.
#[derive(Debug)]
pub struct SubjectWorkspace {
    scratch: TempDir,
    output_dir: PathBuf,
}

impl SubjectWorkspace {
    /// Creates the scratch directory under `scratch_root` and the output directory.
    pub fn create(scratch_root: &Path, output_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        std::fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("vbm-subject-")
            .tempdir_in(scratch_root)?;
        Ok(Self {
            scratch,
            output_dir,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Removes engine leftovers from the output directory.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_scratch_artifact(&name) {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch artifact"),
            }
        }
        removed
    }
}

impl Drop for SubjectWorkspace {
    fn drop(&mut self) {
        let removed = self.sweep();
        if removed > 0 {
            debug!(
                dir = %self.output_dir.display(),
                removed = removed,
                "Swept engine scratch artifacts"
            );
        }
    }
}

fn is_scratch_artifact(name: &str) -> bool {
    name == BATCH_SCRIPT
        || name == WORKFLOW_DIR
        || SCRATCH_PREFIXES.iter().any(|p| name.starts_with(p))
}
