use crate::shared::constants;
use anyhow::Result;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;

/// Per-pixel validity from the depth values alone: positive, finite and
/// inside the configured meter range. 255 marks a valid pixel.
pub fn base_validity_mask(depth: &Mat, min_m: f32, max_m: f32) -> Result<Mat> {
    let mut mask = Mat::new_rows_cols_with_default(
        depth.rows(),
        depth.cols(),
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    {
        let d = depth.data_typed::<f32>()?;
        let m = mask.data_typed_mut::<u8>()?;
        for (dst, &v) in m.iter_mut().zip(d.iter()) {
            if v.is_finite() && v > 0.0 && v >= min_m && v <= max_m {
                *dst = 255;
            }
        }
    }
    Ok(mask)
}

/// Validity contributed by a confidence map: kept while the score stays at
/// or below the threshold (0 best, 100 worst).
pub fn confidence_mask(confidence: &Mat, threshold: u8) -> Result<Mat> {
    let mut mask = Mat::new_rows_cols_with_default(
        confidence.rows(),
        confidence.cols(),
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    {
        let c = confidence.data_typed::<u8>()?;
        let m = mask.data_typed_mut::<u8>()?;
        for (dst, &v) in m.iter_mut().zip(c.iter()) {
            if v <= threshold {
                *dst = 255;
            }
        }
    }
    Ok(mask)
}

/// Valid pixels a frame must keep before confidence filtering is trusted.
pub fn min_valid_floor(total_pixels: usize) -> usize {
    constants::MIN_VALID_PIXEL_FLOOR.max(total_pixels / 1000)
}

/// ANDs the confidence mask into the base mask, then applies the
/// minimum-valid-pixel floor: when the combination keeps fewer than
/// `min_valid_floor` pixels, the confidence contribution is dropped so a
/// noisy frame does not come out near-black. Returns the mask and whether
/// the confidence contribution was discarded.
pub fn combine_with_floor(base: &Mat, confidence: Option<&Mat>) -> Result<(Mat, bool)> {
    let conf = match confidence {
        Some(c) if c.rows() == base.rows() && c.cols() == base.cols() => c,
        _ => return Ok((base.try_clone()?, false)),
    };

    let mut combined = Mat::default();
    core::bitwise_and_def(base, conf, &mut combined)?;

    let total = (base.rows() * base.cols()) as usize;
    let kept = core::count_non_zero(&combined)? as usize;
    if kept < min_valid_floor(total) {
        return Ok((base.try_clone()?, true));
    }
    Ok((combined, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_mat(rows: i32, cols: i32, values: &[f32]) -> Mat {
        let mut mat =
            Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(0.0)).unwrap();
        mat.data_typed_mut::<f32>().unwrap().copy_from_slice(values);
        mat
    }

    fn conf_mat(rows: i32, cols: i32, value: u8) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC1, Scalar::all(value as f64))
            .unwrap()
    }

    #[test]
    fn test_base_mask_rejects_invalid_values() {
        let depth = depth_mat(1, 6, &[5.0, -1.0, 0.0, f32::NAN, f32::INFINITY, 60.0]);
        let mask = base_validity_mask(&depth, 1.0, 50.0).unwrap();
        let m = mask.data_typed::<u8>().unwrap();
        assert_eq!(m, &[255, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_base_mask_honors_range() {
        let depth = depth_mat(1, 3, &[0.5, 5.0, 49.9]);
        let mask = base_validity_mask(&depth, 1.0, 50.0).unwrap();
        assert_eq!(mask.data_typed::<u8>().unwrap(), &[0, 255, 255]);
    }

    #[test]
    fn test_confidence_mask_threshold_inclusive() {
        let mut conf = conf_mat(1, 3, 0);
        conf.data_typed_mut::<u8>().unwrap().copy_from_slice(&[10, 50, 51]);
        let mask = confidence_mask(&conf, 50).unwrap();
        assert_eq!(mask.data_typed::<u8>().unwrap(), &[255, 255, 0]);
    }

    #[test]
    fn test_floor_is_absolute_below_million_pixels() {
        assert_eq!(min_valid_floor(100 * 100), 1000);
        assert_eq!(min_valid_floor(2000 * 2000), 4000);
    }

    #[test]
    fn test_combine_falls_back_when_confidence_empties_mask() {
        // 100x100 all-valid base; confidence rejects everything
        let base = conf_mat(100, 100, 255);
        let conf = conf_mat(100, 100, 0);
        let (mask, dropped) = combine_with_floor(&base, Some(&conf)).unwrap();
        assert!(dropped);
        assert_eq!(core::count_non_zero(&mask).unwrap(), 100 * 100);
    }

    #[test]
    fn test_combine_keeps_confidence_above_floor() {
        let base = conf_mat(200, 200, 255);
        // Confidence keeps the top half: 20000 pixels, above the 1000 floor
        let mut conf = conf_mat(200, 200, 0);
        {
            let c = conf.data_typed_mut::<u8>().unwrap();
            for v in c.iter_mut().take(100 * 200) {
                *v = 255;
            }
        }
        let (mask, dropped) = combine_with_floor(&base, Some(&conf)).unwrap();
        assert!(!dropped);
        assert_eq!(core::count_non_zero(&mask).unwrap(), 100 * 200);
    }

    #[test]
    fn test_combine_ignores_mismatched_confidence() {
        let base = conf_mat(10, 10, 255);
        let conf = conf_mat(5, 5, 0);
        let (mask, dropped) = combine_with_floor(&base, Some(&conf)).unwrap();
        assert!(!dropped);
        assert_eq!(core::count_non_zero(&mask).unwrap(), 100);
    }
}
