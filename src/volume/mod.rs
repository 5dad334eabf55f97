//! In-memory scalar volumes and NIfTI-1 file I/O.
//!
//! A [`Volume`] holds a 3-D array in Fortran (column-major) layout so that
//! voxel order matches the on-disk order: x varies fastest, then y, then z.

pub mod nifti;

use std::path::Path;

use ndarray::{Array3, ShapeBuilder};

use crate::error::VolumeError;

pub use nifti::{probe, NiftiHeader};

/// A 3-D scalar image.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub(crate) data: Array3<f64>,
    /// Voxel edge lengths in millimetres.
    pub voxel_size: [f64; 3],
    /// First three rows of the voxel-to-world matrix, when the file carries one.
    pub affine: Option<[[f64; 4]; 3]>,
}

impl Volume {
    /// Wraps an array with unit voxels and no affine.
    pub fn new(data: Array3<f64>) -> Self {
        Self {
            data,
            voxel_size: [1.0, 1.0, 1.0],
            affine: None,
        }
    }

    /// Builds a volume from values listed with x varying fastest.
    pub fn from_column_major(dims: [usize; 3], values: Vec<f64>) -> Result<Self, VolumeError> {
        let data = Array3::from_shape_vec((dims[0], dims[1], dims[2]).f(), values)?;
        Ok(Self::new(data))
    }

    /// Builder method to set the voxel size.
    pub fn with_voxel_size(mut self, voxel_size: [f64; 3]) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Reads a `.nii` or `.nii.gz` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        nifti::read_volume(path.as_ref())
    }

    /// Writes the volume as float32 NIfTI-1.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VolumeError> {
        nifti::write_volume(path.as_ref(), self)
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn dims(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates voxel values in column-major order.
    pub fn column_major(&self) -> impl Iterator<Item = f64> + '_ {
        // the transposed view's logical order is x fastest
        self.data.t().into_iter().copied()
    }
}
