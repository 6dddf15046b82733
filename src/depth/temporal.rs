use crate::shared::constants;
use anyhow::Result;
use opencv::core::{self, Mat};
use opencv::imgproc;
use opencv::prelude::*;

/// Order-dependent state for one extraction run: the exponential moving
/// average of depth and the previous visualization-input frame for motion
/// differencing. Reset at run start; never shared between runs. Single
/// frame re-processing bypasses this entirely.
pub struct TemporalState {
    alpha: f32,
    ema: Option<Mat>,
    prev: Option<Mat>,
}

impl TemporalState {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            ema: None,
            prev: None,
        }
    }

    pub fn reset(&mut self) {
        self.ema = None;
        self.prev = None;
    }

    /// The depth handed to the visualization transform: the EMA when
    /// smoothing is on, the raw frame otherwise. The first frame seeds the
    /// EMA unsmoothed; a resolution change reseeds it.
    ///
    /// Only visualization consumes this; the raw frame is what goes to disk.
    pub fn visualization_input(&mut self, depth: &Mat, smooth: bool) -> Result<Mat> {
        if !smooth {
            return Ok(depth.try_clone()?);
        }
        let next = match self.ema.take() {
            Some(prev_ema)
                if prev_ema.rows() == depth.rows() && prev_ema.cols() == depth.cols() =>
            {
                let mut next = Mat::default();
                core::add_weighted_def(
                    depth,
                    self.alpha as f64,
                    &prev_ema,
                    (1.0 - self.alpha) as f64,
                    0.0,
                    &mut next,
                )?;
                next
            }
            _ => depth.try_clone()?,
        };
        let out = next.try_clone()?;
        self.ema = Some(next);
        Ok(out)
    }

    /// Binary motion mask against the previous visualization input:
    /// absolute difference normalized by its own maximum, thresholded,
    /// dilated once with a 3x3 element. `None` when there is no usable
    /// predecessor or nothing moved.
    pub fn motion_mask(&self, current: &Mat) -> Result<Option<Mat>> {
        let prev = match &self.prev {
            Some(p) if p.rows() == current.rows() && p.cols() == current.cols() => p,
            _ => return Ok(None),
        };

        let mut diff = Mat::default();
        core::absdiff(current, prev, &mut diff)?;
        // Invalid depth produces NaN differences; they must not win the max
        for v in diff.data_typed_mut::<f32>()? {
            if !v.is_finite() {
                *v = 0.0;
            }
        }

        let mut max_val = 0.0f64;
        core::min_max_loc(
            &diff,
            None,
            Some(&mut max_val),
            None,
            None,
            &core::no_array(),
        )?;
        if max_val <= 0.0 {
            return Ok(None);
        }

        let mut norm = Mat::default();
        diff.convert_to(&mut norm, core::CV_32F, 1.0 / max_val, 0.0)?;
        let mut bin = Mat::default();
        imgproc::threshold(
            &norm,
            &mut bin,
            constants::MOTION_DIFF_THRESHOLD as f64,
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        let mut bin_u8 = Mat::default();
        bin.convert_to(&mut bin_u8, core::CV_8U, 1.0, 0.0)?;

        let kernel = imgproc::get_structuring_element_def(
            imgproc::MORPH_RECT,
            core::Size::new(3, 3),
        )?;
        let mut dilated = Mat::default();
        imgproc::dilate_def(&bin_u8, &mut dilated, &kernel)?;
        Ok(Some(dilated))
    }

    /// Stores the current visualization input as the next frame's motion
    /// baseline. Runs every frame, whether or not highlighting is on, so a
    /// highlight enabled mid-run has a baseline from the next frame onward.
    pub fn advance(&mut self, current: &Mat) -> Result<()> {
        self.prev = Some(current.try_clone()?);
        Ok(())
    }
}

/// Pushes each color channel toward white inside the motion mask.
pub fn apply_motion_highlight(heat: &mut Mat, mask: &Mat, gain: f32) -> Result<()> {
    if mask.rows() != heat.rows() || mask.cols() != heat.cols() {
        return Ok(());
    }
    let gain = gain.clamp(0.0, 1.0);
    let m = mask.data_typed::<u8>()?;
    let pixels = heat.data_typed_mut::<core::Vec3b>()?;
    for (px, mv) in pixels.iter_mut().zip(m.iter()) {
        if *mv != 0 {
            for c in 0..3 {
                let v = px[c] as f32;
                px[c] = (v + (255.0 - v) * gain).round().min(255.0) as u8;
            }
        }
    }
    Ok(())
}
