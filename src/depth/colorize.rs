use super::mask;
use super::{ColorMapKind, EffectiveRange, VisualizationConfig};
use crate::shared::constants;
use anyhow::Result;
use opencv::core::{self, Mat, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use rayon::prelude::*;
use serde::Serialize;

/// Numeric companion to the legend strip: what mapping was actually applied.
#[derive(Debug, Clone, Serialize)]
pub struct LegendInfo {
    pub near_m: f32,
    pub far_m: f32,
    pub color_map: ColorMapKind,
    pub log_scale: bool,
    pub auto_contrast: bool,
}

impl LegendInfo {
    pub fn new(range: EffectiveRange, cfg: &VisualizationConfig) -> Self {
        Self {
            near_m: range.near_m,
            far_m: range.far_m,
            color_map: cfg.color_map,
            log_scale: cfg.log_scale,
            auto_contrast: cfg.auto_contrast,
        }
    }
}

/// Maps one float depth frame to a BGR heatmap.
///
/// Pure: no state survives between calls, the config is never written to,
/// and identical inputs produce identical output. A malformed depth frame
/// (empty, or not CV_32FC1) yields an empty image instead of an error;
/// callers check `ColorFrame::empty()`.
///
/// When `overlay_on_rgb` is set and `rgb` matches the frame shape, the
/// heatmap is alpha-blended onto it with `overlay_strength` percent weight.
pub fn colorize(
    depth: &Mat,
    confidence: Option<&Mat>,
    rgb: Option<&Mat>,
    cfg: &VisualizationConfig,
) -> Result<(Mat, EffectiveRange)> {
    let fallback = EffectiveRange::normalized(cfg.min_depth_m, cfg.max_depth_m);
    if depth.empty() || depth.typ() != core::CV_32FC1 {
        return Ok((Mat::default(), fallback));
    }

    let rows = depth.rows();
    let cols = depth.cols();
    let w = cols as usize;

    // Steps 1-2: validity from depth bounds, then confidence with the
    // minimum-valid-pixel floor fallback.
    let base = mask::base_validity_mask(depth, cfg.min_depth_m, cfg.max_depth_m)?;
    let conf_mask = match confidence {
        Some(c) if c.typ() == core::CV_8UC1 => Some(mask::confidence_mask(c, cfg.confidence_threshold)?),
        _ => None,
    };
    let (valid, _relaxed) = mask::combine_with_floor(&base, conf_mask.as_ref())?;

    // Step 3: effective bounds
    let range = effective_range(depth, &valid, cfg)?;

    // Step 6 input: Sobel magnitude of the unscaled depth, minmax-normalized
    let grad = if cfg.edge_boost {
        Some(gradient_magnitude_norm(depth)?)
    } else {
        None
    };

    // Steps 4-6: scale to [0,1], invert so near is hot, zero invalid
    // pixels, add the edge term under the same mask
    let mut scaled = Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(0.0))?;
    {
        let d = depth.data_typed::<f32>()?;
        let m = valid.data_typed::<u8>()?;
        let out = scaled.data_typed_mut::<f32>()?;

        let (a, b) = (range.near_m, range.far_m);
        let eps = constants::LOG_SCALE_EPSILON;
        let log_a = (a + eps).ln();
        let inv_denom = if cfg.log_scale {
            1.0 / ((b + eps).ln() - log_a)
        } else {
            1.0 / (b - a)
        };
        let log_scale = cfg.log_scale;
        let boost = cfg.edge_boost_factor;
        let grad = grad.as_deref();

        out.par_chunks_mut(w).enumerate().for_each(|(row, orow)| {
            let drow = &d[row * w..row * w + w];
            let mrow = &m[row * w..row * w + w];
            let grow = grad.map(|g| &g[row * w..row * w + w]);
            for i in 0..w {
                if mrow[i] == 0 {
                    orow[i] = 0.0;
                    continue;
                }
                let v = drow[i];
                let t = if log_scale {
                    ((v + eps).ln() - log_a) * inv_denom
                } else {
                    (v - a) * inv_denom
                };
                let mut t = 1.0 - t.clamp(0.0, 1.0);
                if let Some(g) = grow {
                    t = (t + boost * g[i]).min(1.0);
                }
                orow[i] = t;
            }
        });
    }

    // Step 7: quantize
    let mut eight = Mat::default();
    scaled.convert_to(&mut eight, core::CV_8U, 255.0, 0.0)?;

    // Step 8: local contrast
    if cfg.use_clahe {
        let mut clahe = imgproc::create_clahe(
            constants::CLAHE_CLIP_LIMIT,
            core::Size::new(constants::CLAHE_TILE_GRID, constants::CLAHE_TILE_GRID),
        )?;
        let mut eq = Mat::default();
        clahe.apply(&eight, &mut eq)?;
        eight = eq;
    }

    // Step 9: color map, then force invalid pixels to black (the map may
    // have colored them through CLAHE or quantization artifacts)
    let mut heat = Mat::default();
    imgproc::apply_color_map(&eight, &mut heat, cfg.color_map.to_opencv())?;
    let mut invalid = Mat::default();
    core::bitwise_not_def(&valid, &mut invalid)?;
    heat.set_to(&Scalar::all(0.0), &invalid)?;

    // Step 10: optional RGB overlay
    if cfg.overlay_on_rgb {
        if let Some(rgb) = rgb {
            if rgb.rows() == rows && rgb.cols() == cols && rgb.typ() == core::CV_8UC3 {
                let alpha = cfg.overlay_strength.min(100) as f64 / 100.0;
                let mut blended = Mat::default();
                core::add_weighted_def(&heat, alpha, rgb, 1.0 - alpha, 0.0, &mut blended)?;
                heat = blended;
            }
        }
    }

    Ok((heat, range))
}

/// Auto-contrast bounds: 2nd/98th percentile of the valid depth values,
/// kept only when there are enough samples and the spread is usable.
fn effective_range(depth: &Mat, valid: &Mat, cfg: &VisualizationConfig) -> Result<EffectiveRange> {
    let fallback = EffectiveRange::normalized(cfg.min_depth_m, cfg.max_depth_m);
    if !cfg.auto_contrast {
        return Ok(fallback);
    }

    let d = depth.data_typed::<f32>()?;
    let m = valid.data_typed::<u8>()?;
    let mut samples: Vec<f32> = d
        .iter()
        .zip(m.iter())
        .filter(|(_, &mv)| mv != 0)
        .map(|(&v, _)| v)
        .collect();
    if samples.len() < constants::AUTO_CONTRAST_MIN_SAMPLES {
        return Ok(fallback);
    }
    samples.sort_by(f32::total_cmp);

    let lo = nearest_rank(&samples, constants::AUTO_CONTRAST_LOW_PERCENTILE);
    let hi = nearest_rank(&samples, constants::AUTO_CONTRAST_HIGH_PERCENTILE);
    if hi - lo > constants::AUTO_CONTRAST_MIN_SPREAD_M {
        Ok(EffectiveRange::normalized(lo, hi))
    } else {
        Ok(fallback)
    }
}

fn nearest_rank(sorted: &[f32], percentile: f32) -> f32 {
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f32).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

fn gradient_magnitude_norm(depth: &Mat) -> Result<Vec<f32>> {
    // Non-finite values would poison Sobel and the minmax normalization
    let mut clean = depth.try_clone()?;
    for v in clean.data_typed_mut::<f32>()? {
        if !v.is_finite() {
            *v = 0.0;
        }
    }

    let mut gx = Mat::default();
    let mut gy = Mat::default();
    imgproc::sobel_def(&clean, &mut gx, core::CV_32F, 1, 0)?;
    imgproc::sobel_def(&clean, &mut gy, core::CV_32F, 0, 1)?;
    let mut mag = Mat::default();
    core::magnitude(&gx, &gy, &mut mag)?;
    let mut norm = Mat::default();
    core::normalize(
        &mag,
        &mut norm,
        0.0,
        1.0,
        core::NORM_MINMAX,
        -1,
        &core::no_array(),
    )?;
    Ok(norm.data_typed::<f32>()?.to_vec())
}

/// 256x16 gradient strip through the given color map, for display next to
/// the live preview.
pub fn legend_strip(map: ColorMapKind) -> Result<Mat> {
    let mut ramp = Mat::new_rows_cols_with_default(
        constants::LEGEND_HEIGHT,
        constants::LEGEND_WIDTH,
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    {
        let data = ramp.data_typed_mut::<u8>()?;
        let w = constants::LEGEND_WIDTH as usize;
        for (i, v) in data.iter_mut().enumerate() {
            *v = (i % w) as u8;
        }
    }
    let mut strip = Mat::default();
    imgproc::apply_color_map(&ramp, &mut strip, map.to_opencv())?;
    Ok(strip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_mat(rows: i32, cols: i32, value: f32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(value as f64))
            .unwrap()
    }

    fn cfg_1_to_10() -> VisualizationConfig {
        VisualizationConfig {
            min_depth_m: 1.0,
            max_depth_m: 10.0,
            ..VisualizationConfig::default()
        }
    }

    fn colormap_entry(map: ColorMapKind, value: u8) -> core::Vec3b {
        let src =
            Mat::new_rows_cols_with_default(1, 1, core::CV_8UC1, Scalar::all(value as f64)).unwrap();
        let mut dst = Mat::default();
        imgproc::apply_color_map(&src, &mut dst, map.to_opencv()).unwrap();
        *dst.at_2d::<core::Vec3b>(0, 0).unwrap()
    }

    #[test]
    fn test_uniform_depth_yields_solid_color() {
        let depth = depth_mat(100, 100, 5.0);
        let (heat, range) = colorize(&depth, None, None, &cfg_1_to_10()).unwrap();
        assert_eq!(heat.typ(), core::CV_8UC3);
        assert_eq!((range.near_m, range.far_m), (1.0, 10.0));

        // 1 - (5-1)/(10-1) = 0.5556 -> 142 after quantization
        let expected = colormap_entry(ColorMapKind::Turbo, 142);
        let pixels = heat.data_typed::<core::Vec3b>().unwrap();
        assert!(pixels.iter().all(|p| *p == expected));
    }

    #[test]
    fn test_invalid_pixels_are_black() {
        let mut depth = depth_mat(2, 3, 5.0);
        {
            let d = depth.data_typed_mut::<f32>().unwrap();
            d[0] = -1.0;
            d[1] = 0.0;
            d[2] = f32::NAN;
            d[3] = f32::INFINITY;
        }
        let (heat, _) = colorize(&depth, None, None, &cfg_1_to_10()).unwrap();
        let pixels = heat.data_typed::<core::Vec3b>().unwrap();
        let black = core::Vec3b::from([0, 0, 0]);
        assert_eq!(pixels[0], black);
        assert_eq!(pixels[1], black);
        assert_eq!(pixels[2], black);
        assert_eq!(pixels[3], black);
        assert_ne!(pixels[4], black);
        assert_ne!(pixels[5], black);
    }

    #[test]
    fn test_malformed_input_yields_empty_output() {
        let (heat, range) = colorize(&Mat::default(), None, None, &cfg_1_to_10()).unwrap();
        assert!(heat.empty());
        assert!(range.near_m < range.far_m);

        let wrong_type =
            Mat::new_rows_cols_with_default(4, 4, core::CV_8UC1, Scalar::all(5.0)).unwrap();
        let (heat, _) = colorize(&wrong_type, None, None, &cfg_1_to_10()).unwrap();
        assert!(heat.empty());
    }

    #[test]
    fn test_auto_contrast_is_idempotent() {
        // A gradient frame with enough spread to trigger auto-contrast
        let mut depth = depth_mat(40, 40, 0.0);
        {
            let d = depth.data_typed_mut::<f32>().unwrap();
            for (i, v) in d.iter_mut().enumerate() {
                *v = 2.0 + (i as f32) * 0.004;
            }
        }
        let cfg = VisualizationConfig {
            auto_contrast: true,
            ..cfg_1_to_10()
        };
        let (heat1, range1) = colorize(&depth, None, None, &cfg).unwrap();
        let (heat2, range2) = colorize(&depth, None, None, &cfg).unwrap();
        assert_eq!(range1, range2);
        assert!(range1.near_m > 1.0 && range1.far_m < 10.0);
        assert_eq!(
            heat1.data_bytes().unwrap(),
            heat2.data_bytes().unwrap()
        );
    }

    #[test]
    fn test_auto_contrast_falls_back_on_small_spread() {
        let depth = depth_mat(100, 100, 5.0);
        let cfg = VisualizationConfig {
            auto_contrast: true,
            ..cfg_1_to_10()
        };
        let (_, range) = colorize(&depth, None, None, &cfg).unwrap();
        assert_eq!((range.near_m, range.far_m), (1.0, 10.0));
    }

    #[test]
    fn test_confidence_floor_matches_disabled_confidence() {
        let depth = depth_mat(100, 100, 5.0);
        // Every confidence value above the threshold: the combined mask
        // would be empty, so the base mask must win
        let conf =
            Mat::new_rows_cols_with_default(100, 100, core::CV_8UC1, Scalar::all(90.0)).unwrap();
        let cfg = VisualizationConfig {
            confidence_threshold: 50,
            ..cfg_1_to_10()
        };
        let (with_conf, r1) = colorize(&depth, Some(&conf), None, &cfg).unwrap();
        let (without, r2) = colorize(&depth, None, None, &cfg).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(
            with_conf.data_bytes().unwrap(),
            without.data_bytes().unwrap()
        );
    }

    #[test]
    fn test_edge_boost_is_noop_on_flat_depth() {
        let depth = depth_mat(50, 50, 5.0);
        let flat = cfg_1_to_10();
        let boosted = VisualizationConfig {
            edge_boost: true,
            edge_boost_factor: 0.5,
            ..cfg_1_to_10()
        };
        let (h1, _) = colorize(&depth, None, None, &flat).unwrap();
        let (h2, _) = colorize(&depth, None, None, &boosted).unwrap();
        assert_eq!(h1.data_bytes().unwrap(), h2.data_bytes().unwrap());
    }

    #[test]
    fn test_overlay_blends_toward_rgb() {
        let depth = depth_mat(10, 10, 5.0);
        let rgb = Mat::new_rows_cols_with_default(
            10,
            10,
            core::CV_8UC3,
            Scalar::new(200.0, 200.0, 200.0, 0.0),
        )
        .unwrap();
        let cfg = VisualizationConfig {
            overlay_on_rgb: true,
            overlay_strength: 50,
            ..cfg_1_to_10()
        };
        let (blended, _) = colorize(&depth, None, Some(&rgb), &cfg).unwrap();
        let (pure, _) = colorize(&depth, None, None, &cfg_1_to_10()).unwrap();
        let b = blended.at_2d::<core::Vec3b>(0, 0).unwrap();
        let p = pure.at_2d::<core::Vec3b>(0, 0).unwrap();
        // heat*0.5 + 200*0.5, within rounding
        for c in 0..3 {
            let expected = (p[c] as f64 * 0.5 + 200.0 * 0.5).round() as i32;
            assert!((b[c] as i32 - expected).abs() <= 1);
        }
    }

    #[test]
    fn test_legend_strip_shape() {
        let strip = legend_strip(ColorMapKind::Viridis).unwrap();
        assert_eq!(strip.rows(), 16);
        assert_eq!(strip.cols(), 256);
        assert_eq!(strip.typ(), core::CV_8UC3);
        // Gradient endpoints map to the color map endpoints
        let left = *strip.at_2d::<core::Vec3b>(8, 0).unwrap();
        let right = *strip.at_2d::<core::Vec3b>(8, 255).unwrap();
        assert_eq!(left, colormap_entry(ColorMapKind::Viridis, 0));
        assert_eq!(right, colormap_entry(ColorMapKind::Viridis, 255));
    }

    #[test]
    fn test_nearest_rank_selection() {
        let vals: Vec<f32> = (1..=100).map(|v| v as f32).collect();
        assert_eq!(nearest_rank(&vals, 2.0), 2.0);
        assert_eq!(nearest_rank(&vals, 98.0), 98.0);
        assert_eq!(nearest_rank(&vals, 100.0), 100.0);
        assert_eq!(nearest_rank(&[7.5], 2.0), 7.5);
    }
}
