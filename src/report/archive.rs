//! tar.gz packaging of the run output tree.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;

use crate::error::ArchiveError;

/// A written archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the archive bytes.
    pub sha256: String,
    pub files: usize,
}

/// Packs `src_dir` into `dest` as gzip-compressed tar.
///
/// Entries are stored under the source directory's own name so the archive
/// unpacks into a single folder.
pub fn create_archive(src_dir: &Path, dest: &Path) -> Result<ArchiveInfo, ArchiveError> {
    if !src_dir.is_dir() {
        return Err(ArchiveError::EmptySource(src_dir.display().to_string()));
    }
    let root_name = src_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("outputs"));

    let file = File::create(dest)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut tar = TarBuilder::new(enc);

    let files = add_directory_to_tar(&mut tar, src_dir, src_dir, &root_name)?;
    if files == 0 {
        drop(tar);
        let _ = std::fs::remove_file(dest);
        return Err(ArchiveError::EmptySource(src_dir.display().to_string()));
    }

    tar.into_inner()?.finish()?;

    Ok(ArchiveInfo {
        path: dest.to_path_buf(),
        sha256: sha256_file(dest)?,
        files,
    })
}

/// Recursively adds a directory, in name order, returning the file count.
fn add_directory_to_tar<W: io::Write>(
    tar: &mut TarBuilder<W>,
    dir: &Path,
    base: &Path,
    root_name: &Path,
) -> io::Result<usize> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();

    let mut count = 0;
    for path in entries {
        let relative = path.strip_prefix(base).unwrap_or(&path);
        if path.is_dir() {
            count += add_directory_to_tar(tar, &path, base, root_name)?;
        } else {
            tar.append_path_with_name(&path, root_name.join(relative))?;
            count += 1;
        }
    }
    Ok(count)
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    #[test]
    fn test_create_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("vbm_outputs");
        std::fs::create_dir_all(src.join("sub-1/anat/vbm_spm12")).unwrap();
        std::fs::write(src.join("sub-1/anat/vbm_spm12/vbm_corr_value.txt"), "0.95\n").unwrap();
        std::fs::write(src.join("QA_flagged_subjects.txt"), "").unwrap();
        let dest = temp.path().join("vbm_outputs.tar.gz");

        let info = create_archive(&src, &dest).unwrap();
        assert_eq!(info.files, 2);
        assert_eq!(info.sha256.len(), 64);
        assert_eq!(info.sha256, sha256_file(&dest).unwrap());

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "vbm_outputs/QA_flagged_subjects.txt",
                "vbm_outputs/sub-1/anat/vbm_spm12/vbm_corr_value.txt"
            ]
        );
    }

    #[test]
    fn test_empty_source_rejected() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("empty");
        std::fs::create_dir_all(&src).unwrap();
        let dest = temp.path().join("out.tar.gz");

        let err = create_archive(&src, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::EmptySource(_)));
        assert!(!dest.exists());

        let err = create_archive(&temp.path().join("missing"), &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::EmptySource(_)));
    }

    #[test]
    fn test_sha256_known_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
