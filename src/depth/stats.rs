use anyhow::Result;
use opencv::core::{self, Mat, Rect};
use opencv::prelude::*;
use serde::Serialize;

/// Depth statistics over a rectangular region: what the interactive picker
/// reports and what the per-run aggregate is fed from.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegionStats {
    pub min_m: f32,
    pub max_m: f32,
    pub mean_m: f32,
    pub valid_pixels: usize,
    pub total_pixels: usize,
}

impl RegionStats {
    pub fn empty() -> Self {
        Self {
            min_m: 0.0,
            max_m: 0.0,
            mean_m: 0.0,
            valid_pixels: 0,
            total_pixels: 0,
        }
    }
}

/// Computes statistics over `region` of a CV_32FC1 depth frame, counting
/// only pixels that are finite, positive and within the meter range. The
/// region is clamped to the frame; a region fully outside yields zeros.
pub fn region_stats(depth: &Mat, region: Rect, min_m: f32, max_m: f32) -> Result<RegionStats> {
    if depth.empty() || depth.typ() != core::CV_32FC1 {
        return Ok(RegionStats::empty());
    }
    let x0 = region.x.clamp(0, depth.cols());
    let y0 = region.y.clamp(0, depth.rows());
    let x1 = (region.x + region.width).clamp(0, depth.cols());
    let y1 = (region.y + region.height).clamp(0, depth.rows());
    if x0 >= x1 || y0 >= y1 {
        return Ok(RegionStats::empty());
    }

    let data = depth.data_typed::<f32>()?;
    let w = depth.cols() as usize;
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    let mut sum = 0.0f64;
    let mut valid = 0usize;
    for row in y0..y1 {
        let line = &data[row as usize * w..];
        for col in x0..x1 {
            let v = line[col as usize];
            if v.is_finite() && v > 0.0 && v >= min_m && v <= max_m {
                min = min.min(v);
                max = max.max(v);
                sum += v as f64;
                valid += 1;
            }
        }
    }

    let total = ((x1 - x0) * (y1 - y0)) as usize;
    if valid == 0 {
        return Ok(RegionStats {
            total_pixels: total,
            ..RegionStats::empty()
        });
    }
    Ok(RegionStats {
        min_m: min,
        max_m: max,
        mean_m: (sum / valid as f64) as f32,
        valid_pixels: valid,
        total_pixels: total,
    })
}

/// Full-frame convenience wrapper.
pub fn frame_stats(depth: &Mat, min_m: f32, max_m: f32) -> Result<RegionStats> {
    region_stats(
        depth,
        Rect::new(0, 0, depth.cols(), depth.rows()),
        min_m,
        max_m,
    )
}

/// Distance aggregate for the metadata record, accumulated over one run.
#[derive(Debug, Clone)]
pub struct RunStatistics {
    min: f32,
    max: f32,
    mean_sum: f64,
    frames_processed: usize,
    frames_with_depth: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DistanceSummary {
    pub min_detected_distance: f32,
    pub max_detected_distance: f32,
    pub avg_detected_distance: f32,
    pub frames_with_valid_depth: usize,
    pub frames_processed: usize,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            min: f32::MAX,
            max: f32::MIN,
            mean_sum: 0.0,
            frames_processed: 0,
            frames_with_depth: 0,
        }
    }

    pub fn record(&mut self, frame: &RegionStats) {
        self.frames_processed += 1;
        if frame.valid_pixels > 0 {
            self.min = self.min.min(frame.min_m);
            self.max = self.max.max(frame.max_m);
            self.mean_sum += frame.mean_m as f64;
            self.frames_with_depth += 1;
        }
    }

    pub fn summary(&self) -> DistanceSummary {
        if self.frames_with_depth == 0 {
            return DistanceSummary {
                min_detected_distance: 0.0,
                max_detected_distance: 0.0,
                avg_detected_distance: 0.0,
                frames_with_valid_depth: 0,
                frames_processed: self.frames_processed,
            };
        }
        DistanceSummary {
            min_detected_distance: self.min,
            max_detected_distance: self.max,
            avg_detected_distance: (self.mean_sum / self.frames_with_depth as f64) as f32,
            frames_with_valid_depth: self.frames_with_depth,
            frames_processed: self.frames_processed,
        }
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Scalar;

    fn depth_mat(rows: i32, cols: i32, values: &[f32]) -> Mat {
        let mut mat =
            Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(0.0)).unwrap();
        mat.data_typed_mut::<f32>().unwrap().copy_from_slice(values);
        mat
    }

    #[test]
    fn test_region_stats_basic() {
        let depth = depth_mat(2, 3, &[1.0, 2.0, 3.0, 4.0, -1.0, f32::NAN]);
        let stats = frame_stats(&depth, 0.5, 10.0).unwrap();
        assert_eq!(stats.valid_pixels, 4);
        assert_eq!(stats.total_pixels, 6);
        assert_eq!(stats.min_m, 1.0);
        assert_eq!(stats.max_m, 4.0);
        assert!((stats.mean_m - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_region_clamped_to_frame() {
        let depth = depth_mat(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let stats = region_stats(&depth, Rect::new(1, 1, 10, 10), 0.5, 10.0).unwrap();
        assert_eq!(stats.valid_pixels, 1);
        assert_eq!(stats.min_m, 4.0);

        let outside = region_stats(&depth, Rect::new(5, 5, 3, 3), 0.5, 10.0).unwrap();
        assert_eq!(outside.total_pixels, 0);
        assert_eq!(outside.valid_pixels, 0);
    }

    #[test]
    fn test_run_statistics_aggregate() {
        let mut run = RunStatistics::new();
        run.record(&RegionStats {
            min_m: 2.0,
            max_m: 8.0,
            mean_m: 5.0,
            valid_pixels: 10,
            total_pixels: 10,
        });
        run.record(&RegionStats::empty());
        run.record(&RegionStats {
            min_m: 1.0,
            max_m: 6.0,
            mean_m: 3.0,
            valid_pixels: 10,
            total_pixels: 10,
        });

        let s = run.summary();
        assert_eq!(s.frames_processed, 3);
        assert_eq!(s.frames_with_valid_depth, 2);
        assert_eq!(s.min_detected_distance, 1.0);
        assert_eq!(s.max_detected_distance, 8.0);
        assert!((s.avg_detected_distance - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_run_summary_is_zeroed() {
        let run = RunStatistics::new();
        let s = run.summary();
        assert_eq!(s.min_detected_distance, 0.0);
        assert_eq!(s.max_detected_distance, 0.0);
        assert_eq!(s.frames_processed, 0);
    }
}
