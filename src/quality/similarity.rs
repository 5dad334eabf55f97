//! Masked zero-mean normalized correlation between two volumes.
//!
//! Both volumes are flattened in column-major order and compared
//! position by position. Only voxels that are non-zero in both volumes
//! contribute; each side is centred on its own masked mean before the
//! normalized dot product is taken.

use std::path::Path;

use crate::error::DegenerateInputError;
use crate::volume::Volume;

/// Variance below this fraction of the raw energy is treated as zero.
const RELATIVE_VARIANCE_FLOOR: f64 = 1e-12;

/// Computes the similarity of `candidate` to `reference`, in [-1, 1].
///
/// # Errors
///
/// - `ShapeMismatch` when the voxel counts differ.
/// - `EmptyOverlap` when no position is non-zero in both volumes.
/// - `ZeroVariance` when either side is constant inside the mask.
pub fn compute(reference: &Volume, candidate: &Volume) -> Result<f64, DegenerateInputError> {
    if reference.len() != candidate.len() {
        return Err(DegenerateInputError::ShapeMismatch {
            reference: reference.len(),
            candidate: candidate.len(),
        });
    }

    let pairs: Vec<(f64, f64)> = reference
        .column_major()
        .zip(candidate.column_major())
        .map(|(a, b)| (finite_or_zero(a), finite_or_zero(b)))
        .filter(|(a, b)| *a != 0.0 && *b != 0.0)
        .collect();

    correlate(&pairs)
}

/// Computes the correlation over masked voxel pairs.
fn correlate(pairs: &[(f64, f64)]) -> Result<f64, DegenerateInputError> {
    if pairs.is_empty() {
        return Err(DegenerateInputError::EmptyOverlap);
    }

    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;

    let mut dot = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut energy_a = 0.0;
    let mut energy_b = 0.0;
    for (a, b) in pairs {
        let da = a - mean_a;
        let db = b - mean_b;
        dot += da * db;
        var_a += da * da;
        var_b += db * db;
        energy_a += a * a;
        energy_b += b * b;
    }

    if var_a <= RELATIVE_VARIANCE_FLOOR * energy_a || var_b <= RELATIVE_VARIANCE_FLOOR * energy_b {
        return Err(DegenerateInputError::ZeroVariance);
    }

    let score = dot / (var_a * var_b).sqrt();
    Ok(score.clamp(-1.0, 1.0))
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Formats a score the way it is persisted: two decimals and a newline.
pub fn format_score(score: f64) -> String {
    format!("{:3.2}\n", score)
}

/// Writes the score file for one subject.
pub fn write_score_file(path: &Path, score: f64) -> std::io::Result<()> {
    std::fs::write(path, format_score(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(values: Vec<f64>) -> Volume {
        let n = values.len();
        Volume::from_column_major([n, 1, 1], values).unwrap()
    }

    #[test]
    fn test_identical_volumes_score_one() {
        let a = volume(vec![0.2, 0.5, 0.9, 0.0, 0.7, 0.3]);
        let score = compute(&a, &a).unwrap();
        assert!((score - 1.0).abs() < 1e-12);
        assert_eq!(format_score(score), "1.00\n");
    }

    #[test]
    fn test_symmetry() {
        let a = volume(vec![0.1, 0.4, 0.8, 0.3, 0.0, 0.6]);
        let b = volume(vec![0.2, 0.3, 0.9, 0.1, 0.5, 0.4]);
        assert_eq!(compute(&a, &b).unwrap(), compute(&b, &a).unwrap());
    }

    #[test]
    fn test_anticorrelated() {
        let a = volume(vec![1.0, 2.0, 3.0]);
        let b = volume(vec![3.0, 2.0, 1.0]);
        assert!((compute(&a, &b).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mask_excludes_zero_positions() {
        // the last voxel is outside the mask, so its outlier value is ignored
        let a = volume(vec![1.0, 2.0, 3.0, 0.0]);
        let b = volume(vec![2.0, 4.0, 6.0, 1000.0]);
        assert!((compute(&a, &b).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_values_become_zero() {
        let a = volume(vec![1.0, 2.0, 3.0, f64::NAN]);
        let b = volume(vec![1.0, 2.0, 3.0, 5.0]);
        assert!((compute(&a, &b).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_support_is_degenerate() {
        let a = volume(vec![1.0, 0.0, 2.0, 0.0]);
        let b = volume(vec![0.0, 3.0, 0.0, 4.0]);
        assert_eq!(compute(&a, &b), Err(DegenerateInputError::EmptyOverlap));
    }

    #[test]
    fn test_constant_volume_is_degenerate() {
        let a = volume(vec![0.1, 0.1, 0.1]);
        let b = volume(vec![0.2, 0.5, 0.9]);
        assert_eq!(compute(&a, &b), Err(DegenerateInputError::ZeroVariance));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = volume(vec![1.0, 2.0]);
        let b = volume(vec![1.0, 2.0, 3.0]);
        assert_eq!(
            compute(&a, &b),
            Err(DegenerateInputError::ShapeMismatch {
                reference: 2,
                candidate: 3
            })
        );
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(0.876), "0.88\n");
        assert_eq!(format_score(-0.2), "-0.20\n");
    }

    #[test]
    fn test_write_score_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("vbm_corr_value.txt");
        write_score_file(&path, 0.934).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0.93\n");
    }
}
