//! Minimal NIfTI-1 single-file (`.nii`, `.nii.gz`) codec.
//!
//! Only what the batch engine needs: scalar 3-D/4-D images in the common
//! integer and float datatypes, either byte order, with intensity scaling.
//! Writes are always little-endian float32 with a 352-byte voxel offset.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array3, ShapeBuilder};

use crate::error::VolumeError;

use super::Volume;

const HEADER_SIZE: usize = 348;
const WRITE_VOX_OFFSET: usize = 352;
const MAX_VOX_OFFSET: f32 = u32::MAX as f32;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Parsed subset of a NIfTI-1 header.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub little_endian: bool,
    /// `dim[0..8]` as stored.
    pub dim: [i16; 8],
    pub datatype: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: usize,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub sform_code: i16,
    pub srow: [[f32; 4]; 3],
}

impl NiftiHeader {
    /// Spatial extent `[nx, ny, nz]`.
    pub fn spatial_dims(&self) -> [usize; 3] {
        [
            self.dim[1].max(1) as usize,
            self.dim[2].max(1) as usize,
            self.dim[3].max(1) as usize,
        ]
    }

    fn bytes_per_voxel(&self) -> Result<usize, VolumeError> {
        match self.datatype {
            2 | 256 => Ok(1),
            4 | 512 => Ok(2),
            8 | 16 | 768 => Ok(4),
            64 => Ok(8),
            other => Err(VolumeError::UnsupportedDatatype(other)),
        }
    }
}

struct ByteView<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl<'a> ByteView<'a> {
    fn array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[at..at + N]);
        out
    }

    fn i16(&self, at: usize) -> i16 {
        let raw = self.array::<2>(at);
        if self.little_endian {
            i16::from_le_bytes(raw)
        } else {
            i16::from_be_bytes(raw)
        }
    }

    fn f32(&self, at: usize) -> f32 {
        let raw = self.array::<4>(at);
        if self.little_endian {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        }
    }

    fn voxel(&self, at: usize, datatype: i16) -> f64 {
        let le = self.little_endian;
        match datatype {
            2 => self.bytes[at] as f64,
            256 => self.bytes[at] as i8 as f64,
            4 => self.i16(at) as f64,
            512 => {
                let raw = self.array::<2>(at);
                (if le { u16::from_le_bytes(raw) } else { u16::from_be_bytes(raw) }) as f64
            }
            8 => {
                let raw = self.array::<4>(at);
                (if le { i32::from_le_bytes(raw) } else { i32::from_be_bytes(raw) }) as f64
            }
            768 => {
                let raw = self.array::<4>(at);
                (if le { u32::from_le_bytes(raw) } else { u32::from_be_bytes(raw) }) as f64
            }
            16 => self.f32(at) as f64,
            64 => {
                let raw = self.array::<8>(at);
                if le {
                    f64::from_le_bytes(raw)
                } else {
                    f64::from_be_bytes(raw)
                }
            }
            _ => f64::NAN,
        }
    }
}

/// Parses the header at the start of an uncompressed NIfTI-1 byte buffer.
pub fn parse_header(bytes: &[u8]) -> Result<NiftiHeader, VolumeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(VolumeError::InvalidHeader(format!(
            "file is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let sizeof_hdr = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let little_endian = if i32::from_le_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
        false
    } else {
        return Err(VolumeError::InvalidHeader(
            "sizeof_hdr is not 348".to_string(),
        ));
    };

    match &bytes[344..348] {
        b"n+1\0" => {}
        b"ni1\0" => {
            return Err(VolumeError::InvalidHeader(
                "detached header/image pairs are not supported".to_string(),
            ))
        }
        _ => return Err(VolumeError::InvalidHeader("bad magic".to_string())),
    }

    let view = ByteView {
        bytes,
        little_endian,
    };

    let mut dim = [0i16; 8];
    for (i, d) in dim.iter_mut().enumerate() {
        *d = view.i16(40 + i * 2);
    }
    let mut pixdim = [0f32; 8];
    for (i, p) in pixdim.iter_mut().enumerate() {
        *p = view.f32(76 + i * 4);
    }
    let mut srow = [[0f32; 4]; 3];
    for (r, row) in srow.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = view.f32(280 + r * 16 + c * 4);
        }
    }

    let vox_offset = view.f32(108);
    if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
        return Err(VolumeError::InvalidHeader(format!(
            "vox_offset {} is inside the header",
            vox_offset
        )));
    }
    if vox_offset > MAX_VOX_OFFSET {
        return Err(VolumeError::InvalidHeader(format!(
            "vox_offset {} is out of range",
            vox_offset
        )));
    }

    Ok(NiftiHeader {
        little_endian,
        dim,
        datatype: view.i16(70),
        pixdim,
        vox_offset: vox_offset as usize,
        scl_slope: view.f32(112),
        scl_inter: view.f32(116),
        sform_code: view.i16(254),
        srow,
    })
}

/// Decodes a whole uncompressed NIfTI-1 file. 4-D images keep their first frame.
pub fn decode(bytes: &[u8]) -> Result<Volume, VolumeError> {
    let header = parse_header(bytes)?;

    let ndim = header.dim[0];
    if !(3..=7).contains(&ndim) || (5..=ndim as usize).any(|i| header.dim[i] > 1) {
        return Err(VolumeError::UnsupportedDimensions(ndim));
    }
    if header.dim[1..=3].iter().any(|&d| d < 1) {
        return Err(VolumeError::InvalidHeader(format!(
            "non-positive spatial dimension in {:?}",
            &header.dim[1..=3]
        )));
    }

    let bpp = header.bytes_per_voxel()?;
    let [nx, ny, nz] = header.spatial_dims();
    let count = nx
        .checked_mul(ny)
        .and_then(|n| n.checked_mul(nz))
        .ok_or_else(|| VolumeError::InvalidHeader("voxel count overflows".to_string()))?;
    let expected = count
        .checked_mul(bpp)
        .and_then(|n| n.checked_add(header.vox_offset))
        .ok_or_else(|| VolumeError::InvalidHeader("image extent overflows".to_string()))?;
    if bytes.len() < expected {
        return Err(VolumeError::Truncated {
            expected,
            found: bytes.len(),
        });
    }

    let view = ByteView {
        bytes,
        little_endian: header.little_endian,
    };
    let scaled = header.scl_slope != 0.0 && header.scl_slope.is_finite();
    let slope = header.scl_slope as f64;
    let inter = header.scl_inter as f64;

    let values: Vec<f64> = (0..count)
        .map(|i| {
            let raw = view.voxel(header.vox_offset + i * bpp, header.datatype);
            if scaled {
                raw * slope + inter
            } else {
                raw
            }
        })
        .collect();

    let data = Array3::from_shape_vec((nx, ny, nz).f(), values)?;
    let voxel_size = [
        header.pixdim[1].abs() as f64,
        header.pixdim[2].abs() as f64,
        header.pixdim[3].abs() as f64,
    ];
    let affine = (header.sform_code > 0).then(|| {
        header
            .srow
            .map(|row| row.map(|v| v as f64))
    });

    Ok(Volume {
        data,
        voxel_size,
        affine,
    })
}

/// Reads a `.nii` or gzip-compressed `.nii.gz` file into memory, decompressed.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>, VolumeError> {
    let mut raw = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut raw)?;
    if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

/// Reads only the header of a volume file.
pub fn probe(path: &Path) -> Result<NiftiHeader, VolumeError> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let read = file.read(&mut magic)?;
    drop(file);

    let file = BufReader::new(File::open(path)?);
    let mut head = Vec::with_capacity(HEADER_SIZE);
    if read == 2 && magic == GZIP_MAGIC {
        GzDecoder::new(file)
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut head)?;
    } else {
        file.take(HEADER_SIZE as u64).read_to_end(&mut head)?;
    }
    parse_header(&head)
}

/// Reads a volume from disk.
pub fn read_volume(path: &Path) -> Result<Volume, VolumeError> {
    decode(&read_bytes(path)?)
}

/// Copies a volume file to `dest`, decompressing it when the source is gzipped.
pub fn copy_uncompressed(src: &Path, dest: &Path) -> Result<u64, VolumeError> {
    let mut input = BufReader::new(File::open(src)?);
    let mut magic = [0u8; 2];
    let peeked = input.read(&mut magic)?;
    let mut output = BufWriter::new(File::create(dest)?);

    let head = io::Cursor::new(magic[..peeked].to_vec());
    let written = if peeked == 2 && magic == GZIP_MAGIC {
        io::copy(&mut GzDecoder::new(head.chain(input)), &mut output)?
    } else {
        io::copy(&mut head.chain(input), &mut output)?
    };
    output.flush()?;
    Ok(written)
}

/// Encodes a volume as little-endian float32 NIfTI-1.
pub fn encode(volume: &Volume) -> Vec<u8> {
    let [nx, ny, nz] = volume.dims();
    let mut out = vec![0u8; WRITE_VOX_OFFSET];

    let put_i16 = |buf: &mut [u8], at: usize, v: i16| {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    };
    let put_f32 = |buf: &mut [u8], at: usize, v: f32| {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    };

    out[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    let dim = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        put_i16(&mut out, 40 + i * 2, *d);
    }
    put_i16(&mut out, 70, 16);
    put_i16(&mut out, 72, 32);

    let [vx, vy, vz] = volume.voxel_size;
    let pixdim = [1.0, vx as f32, vy as f32, vz as f32, 0.0, 0.0, 0.0, 0.0];
    for (i, p) in pixdim.iter().enumerate() {
        put_f32(&mut out, 76 + i * 4, *p);
    }
    put_f32(&mut out, 108, WRITE_VOX_OFFSET as f32);
    put_f32(&mut out, 112, 1.0);
    // xyzt_units: mm
    out[123] = 2;

    if let Some(affine) = &volume.affine {
        put_i16(&mut out, 254, 1);
        for (r, row) in affine.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                put_f32(&mut out, 280 + r * 16 + c * 4, *v as f32);
            }
        }
    }
    out[344..348].copy_from_slice(b"n+1\0");

    out.reserve(volume.len() * 4);
    for v in volume.column_major() {
        out.extend_from_slice(&(v as f32).to_le_bytes());
    }
    out
}

/// Writes a volume to disk, gzip-compressed when the path ends in `.gz`.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<(), VolumeError> {
    let bytes = encode(volume);
    let file = BufWriter::new(File::create(path)?);
    let gz = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        file.write_all(&bytes)?;
        file.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp() -> Volume {
        Volume::from_column_major([3, 2, 2], (0..12).map(|v| v as f64).collect()).unwrap()
    }

    #[test]
    fn test_encode_decode_preserves_order() {
        let volume = ramp().with_voxel_size([2.0, 2.0, 2.5]);
        let decoded = decode(&encode(&volume)).unwrap();

        assert_eq!(decoded.dims(), [3, 2, 2]);
        assert_eq!(decoded.voxel_size, [2.0, 2.0, 2.5]);
        // x varies fastest
        assert_eq!(decoded.data()[[1, 0, 0]], 1.0);
        assert_eq!(decoded.data()[[0, 1, 0]], 3.0);
        assert_eq!(decoded.data()[[0, 0, 1]], 6.0);
    }

    #[test]
    fn test_decode_rejects_out_of_range_vox_offset() {
        let mut bytes = encode(&ramp());
        bytes[108..112].copy_from_slice(&1.0e30f32.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(VolumeError::InvalidHeader(_))));

        bytes[108..112].copy_from_slice(&1.0e6f32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(VolumeError::Truncated { expected, .. }) if expected == 1_000_000 + 12 * 4
        ));
    }

    #[test]
    fn test_gz_round_trip_on_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("scan.nii.gz");
        write_volume(&path, &ramp()).unwrap();

        let header = probe(&path).unwrap();
        assert_eq!(header.spatial_dims(), [3, 2, 2]);
        assert_eq!(header.datatype, 16);

        let volume = read_volume(&path).unwrap();
        assert_eq!(volume.column_major().collect::<Vec<_>>(), (0..12).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_copy_uncompressed_gunzips() {
        let temp = TempDir::new().unwrap();
        let gz = temp.path().join("scan.nii.gz");
        let plain = temp.path().join("scan.nii");
        write_volume(&gz, &ramp()).unwrap();

        let written = copy_uncompressed(&gz, &plain).unwrap();
        assert_eq!(written as usize, WRITE_VOX_OFFSET + 12 * 4);

        let raw = std::fs::read(&plain).unwrap();
        assert!(!raw.starts_with(&GZIP_MAGIC));
        assert_eq!(decode(&raw).unwrap().len(), 12);
    }

    #[test]
    fn test_int16_with_scaling_big_endian() {
        let mut bytes = vec![0u8; 352];
        bytes[0..4].copy_from_slice(&348i32.to_be_bytes());
        for (i, d) in [3i16, 2, 1, 1, 1, 1, 1, 1].iter().enumerate() {
            bytes[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_be_bytes());
        }
        bytes[70..72].copy_from_slice(&4i16.to_be_bytes());
        bytes[108..112].copy_from_slice(&352f32.to_be_bytes());
        bytes[112..116].copy_from_slice(&2f32.to_be_bytes());
        bytes[116..120].copy_from_slice(&1f32.to_be_bytes());
        bytes[344..348].copy_from_slice(b"n+1\0");
        bytes.extend_from_slice(&10i16.to_be_bytes());
        bytes.extend_from_slice(&(-3i16).to_be_bytes());

        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.column_major().collect::<Vec<_>>(), vec![21.0, -5.0]);
    }

    #[test]
    fn test_four_d_keeps_first_frame() {
        let mut bytes = encode(&ramp());
        bytes[40..42].copy_from_slice(&4i16.to_le_bytes());
        bytes[48..50].copy_from_slice(&2i16.to_le_bytes());
        for v in 100..112 {
            bytes.extend_from_slice(&(v as f32).to_le_bytes());
        }

        let volume = decode(&bytes).unwrap();
        assert_eq!(volume.len(), 12);
        assert_eq!(volume.column_major().last(), Some(11.0));
    }

    #[test]
    fn test_truncated_data() {
        let mut bytes = encode(&ramp());
        bytes.truncate(bytes.len() - 4);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, VolumeError::Truncated { .. }));
    }

    #[test]
    fn test_rejects_non_nifti() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("shorter than"));

        let mut bytes = encode(&ramp());
        bytes[344..348].copy_from_slice(b"xxxx");
        assert!(decode(&bytes).unwrap_err().to_string().contains("bad magic"));
    }

    #[test]
    fn test_unsupported_datatype() {
        let mut bytes = encode(&ramp());
        bytes[70..72].copy_from_slice(&32i16.to_le_bytes());
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            VolumeError::UnsupportedDatatype(32)
        ));
    }
}
