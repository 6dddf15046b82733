use super::RawDepthFormat;
use crate::utils::logger;
use anyhow::{anyhow, bail, Context, Result};
use opencv::core::{self, Mat, Scalar};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Writes and reads single float depth frames in the interchangeable raw
/// formats. The instance carries the run-scoped fallback state: EXR output
/// is disabled for the rest of the run after its first failure, and any
/// other write failure warns once instead of flooding the log.
pub struct DepthCodec {
    exr_disabled: AtomicBool,
    write_warned: AtomicBool,
}

impl DepthCodec {
    pub fn new() -> Self {
        Self {
            exr_disabled: AtomicBool::new(false),
            write_warned: AtomicBool::new(false),
        }
    }

    /// Per-frame write with the soft-failure policy: returns whether the
    /// frame landed on disk. Failures are logged (once) and never abort
    /// the run.
    pub fn write_frame(&self, depth: &Mat, path: &Path, format: RawDepthFormat) -> bool {
        if format == RawDepthFormat::Exr && self.exr_disabled.load(Ordering::Relaxed) {
            return false;
        }
        match write(depth, path, format) {
            Ok(()) => true,
            Err(e) => {
                if format == RawDepthFormat::Exr {
                    if !self.exr_disabled.swap(true, Ordering::Relaxed) {
                        logger::warn(&format!(
                            "EXR write failed ({}); disabling EXR output for the remainder of this run",
                            e
                        ));
                    }
                } else if !self.write_warned.swap(true, Ordering::Relaxed) {
                    logger::warn(&format!(
                        "Raw depth write failed ({}); affected frames will be skipped",
                        e
                    ));
                }
                false
            }
        }
    }

    pub fn exr_disabled(&self) -> bool {
        self.exr_disabled.load(Ordering::Relaxed)
    }
}

impl Default for DepthCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))
}

/// Serializes one CV_32FC1 depth frame.
pub fn write(depth: &Mat, path: &Path, format: RawDepthFormat) -> Result<()> {
    if depth.empty() || depth.typ() != core::CV_32FC1 {
        bail!("Depth frame must be non-empty CV_32FC1");
    }
    let owned;
    let depth = if depth.is_continuous() {
        depth
    } else {
        owned = depth.try_clone()?;
        &owned
    };

    match format {
        RawDepthFormat::Tiff | RawDepthFormat::Exr => {
            let ok = imgcodecs::imwrite_def(path_str(path)?, depth)
                .with_context(|| format!("imwrite failed for {}", path.display()))?;
            if !ok {
                bail!("imwrite refused {}", path.display());
            }
            Ok(())
        }
        RawDepthFormat::Pfm => {
            let data = depth.data_typed::<f32>()?;
            let mut bytes = Vec::with_capacity(32 + data.len() * 4);
            bytes.extend_from_slice(
                format!("Pf\n{} {}\n-1.0\n", depth.cols(), depth.rows()).as_bytes(),
            );
            for v in data {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
        }
        RawDepthFormat::Bin => {
            let data = depth.data_typed::<f32>()?;
            let mut bytes = Vec::with_capacity(data.len() * 4);
            for v in data {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
        }
    }
}

/// Deserializes a depth frame written by [`write`]. The headerless binary
/// dump cannot recover its own shape, so `dimensions` (rows, cols) must be
/// supplied for it.
pub fn read(path: &Path, format: RawDepthFormat, dimensions: Option<(i32, i32)>) -> Result<Mat> {
    match format {
        RawDepthFormat::Tiff | RawDepthFormat::Exr => {
            let mat = imgcodecs::imread(path_str(path)?, imgcodecs::IMREAD_UNCHANGED)
                .with_context(|| format!("imread failed for {}", path.display()))?;
            if mat.empty() {
                bail!("Could not decode {}", path.display());
            }
            if mat.typ() != core::CV_32FC1 {
                bail!("{} is not a single-channel float image", path.display());
            }
            Ok(mat)
        }
        RawDepthFormat::Pfm => read_pfm(path),
        RawDepthFormat::Bin => {
            let (rows, cols) = dimensions
                .ok_or_else(|| anyhow!("Raw binary depth requires external dimensions"))?;
            let bytes = fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let expected = rows as usize * cols as usize * 4;
            if bytes.len() != expected {
                bail!(
                    "{}: expected {} bytes for {}x{}, found {}",
                    path.display(),
                    expected,
                    cols,
                    rows,
                    bytes.len()
                );
            }
            floats_to_mat(&bytes, rows, cols, true)
        }
    }
}

fn read_pfm(path: &Path) -> Result<Mat> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    // Header: three '\n'-terminated lines, then raw float32 data
    let mut offset = 0usize;
    let mut next_line = || -> Result<String> {
        let start = offset;
        while offset < bytes.len() && bytes[offset] != b'\n' {
            offset += 1;
        }
        if offset >= bytes.len() {
            bail!("Truncated PFM header in {}", path.display());
        }
        let line = std::str::from_utf8(&bytes[start..offset])
            .context("PFM header is not valid UTF-8")?
            .to_string();
        offset += 1;
        Ok(line)
    };

    let magic = next_line()?;
    if magic.trim() != "Pf" {
        bail!("{} is not a grayscale PFM file", path.display());
    }
    let dims = next_line()?;
    let mut it = dims.split_whitespace();
    let cols: i32 = it
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("Bad PFM dimensions in {}", path.display()))?;
    let rows: i32 = it
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("Bad PFM dimensions in {}", path.display()))?;
    let scale: f32 = next_line()?
        .trim()
        .parse()
        .map_err(|_| anyhow!("Bad PFM scale in {}", path.display()))?;

    let data = &bytes[offset..];
    let expected = rows as usize * cols as usize * 4;
    if data.len() < expected {
        bail!("Truncated PFM data in {}", path.display());
    }
    // A negative scale marks little-endian data
    floats_to_mat(&data[..expected], rows, cols, scale < 0.0)
}

fn floats_to_mat(bytes: &[u8], rows: i32, cols: i32, little_endian: bool) -> Result<Mat> {
    let mut mat =
        Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(0.0))?;
    let out = mat.data_typed_mut::<f32>()?;
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
        *dst = if little_endian {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        };
    }
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_depth() -> Mat {
        let values: &[f32] = &[0.5, -1.25, 3.75, 1e-3, 123456.78, 9.0];
        let mut mat =
            Mat::new_rows_cols_with_default(2, 3, core::CV_32FC1, Scalar::all(0.0)).unwrap();
        mat.data_typed_mut::<f32>().unwrap().copy_from_slice(values);
        mat
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("svo_extract_codec_tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_pfm_round_trip_bit_exact() {
        let dir = scratch_dir("pfm");
        let path = dir.join("depth_000001.pfm");
        let depth = sample_depth();
        write(&depth, &path, RawDepthFormat::Pfm).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"Pf\n3 2\n-1.0\n"));

        let back = read(&path, RawDepthFormat::Pfm, None).unwrap();
        assert_eq!(back.rows(), 2);
        assert_eq!(back.cols(), 3);
        assert_eq!(
            depth.data_typed::<f32>().unwrap(),
            back.data_typed::<f32>().unwrap()
        );
    }

    #[test]
    fn test_bin_round_trip_requires_dimensions() {
        let dir = scratch_dir("bin");
        let path = dir.join("depth_000001.bin");
        let depth = sample_depth();
        write(&depth, &path, RawDepthFormat::Bin).unwrap();

        assert!(read(&path, RawDepthFormat::Bin, None).is_err());

        let back = read(&path, RawDepthFormat::Bin, Some((2, 3))).unwrap();
        assert_eq!(
            depth.data_typed::<f32>().unwrap(),
            back.data_typed::<f32>().unwrap()
        );

        // Wrong shape is rejected rather than misread
        assert!(read(&path, RawDepthFormat::Bin, Some((3, 3))).is_err());
    }

    #[test]
    fn test_tiff_round_trip() {
        let dir = scratch_dir("tiff");
        let path = dir.join("depth_000001.tiff");
        let depth = sample_depth();
        write(&depth, &path, RawDepthFormat::Tiff).unwrap();
        let back = read(&path, RawDepthFormat::Tiff, None).unwrap();
        assert_eq!(
            depth.data_typed::<f32>().unwrap(),
            back.data_typed::<f32>().unwrap()
        );
    }

    #[test]
    fn test_write_rejects_wrong_type() {
        let dir = scratch_dir("badtype");
        let mat =
            Mat::new_rows_cols_with_default(2, 2, core::CV_8UC1, Scalar::all(1.0)).unwrap();
        assert!(write(&mat, &dir.join("x.pfm"), RawDepthFormat::Pfm).is_err());
        assert!(write(&Mat::default(), &dir.join("y.pfm"), RawDepthFormat::Pfm).is_err());
    }

    #[test]
    fn test_exr_failure_disables_for_run() {
        let dir = scratch_dir("exr_disable");
        let codec = DepthCodec::new();
        let depth = sample_depth();

        // First EXR write into a nonexistent directory fails and trips the
        // run-scoped disable flag
        let bad = dir.join("missing_subdir").join("depth.exr");
        assert!(!codec.write_frame(&depth, &bad, RawDepthFormat::Exr));
        assert!(codec.exr_disabled());

        // From now on EXR writes are skipped without touching the disk
        let good = dir.join("depth.exr");
        assert!(!codec.write_frame(&depth, &good, RawDepthFormat::Exr));
        assert!(!good.exists());

        // Other formats are unaffected
        let pfm = dir.join("depth.pfm");
        assert!(codec.write_frame(&depth, &pfm, RawDepthFormat::Pfm));
        assert!(pfm.exists());
    }

    #[test]
    fn test_write_frame_soft_failure() {
        let dir = scratch_dir("softfail");
        let codec = DepthCodec::new();
        let depth = sample_depth();
        let bad = dir.join("no_such_dir").join("depth.pfm");
        assert!(!codec.write_frame(&depth, &bad, RawDepthFormat::Pfm));
        assert!(!codec.write_frame(&depth, &bad, RawDepthFormat::Pfm));
        // PFM failures never disable EXR
        assert!(!codec.exr_disabled());
    }

    #[test]
    fn test_pfm_rejects_color_variant() {
        let dir = scratch_dir("pfm_color");
        let path = dir.join("color.pfm");
        std::fs::write(&path, b"PF\n2 2\n-1.0\n0000000000000000").unwrap();
        assert!(read(&path, RawDepthFormat::Pfm, None).is_err());
    }
}
