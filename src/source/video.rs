use super::{FrameSource, Measure, SourceProperties, View};
use crate::utils::logger;
use anyhow::{anyhow, bail, Context, Result};
use opencv::core::{self, Mat, Rect};
use opencv::prelude::*;
use opencv::{imgproc, videoio};
use std::path::{Path, PathBuf};

/// OpenCV capture backend for stereo recordings exported as ordinary video
/// containers. Depth and confidence measures are not available here; the
/// dataset backend (or an SDK-backed reader) covers those.
pub struct VideoSource {
    capture: videoio::VideoCapture,
    path: PathBuf,
    props: SourceProperties,
    /// Frames hold both eyes side by side; views are the halves.
    stereo_side_by_side: bool,
    current: Mat,
    next_index: i32,
}

impl VideoSource {
    pub fn open(path: &Path, stereo_side_by_side: bool) -> Result<Self> {
        if !path.is_file() {
            bail!("Recording not found: {}", path.display());
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))?;

        // CAP_ANY lets OpenCV pick the best backend for the container
        let mut capture = videoio::VideoCapture::from_file(path_str, videoio::CAP_ANY)
            .with_context(|| format!("Failed to create capture for {}", path.display()))?;

        // Best effort; not all backends honor it
        let _ = capture.set(
            videoio::CAP_PROP_HW_ACCELERATION,
            videoio::VIDEO_ACCELERATION_ANY as f64,
        );

        if !capture.is_opened()? {
            bail!("Failed to open recording: {}", path.display());
        }

        let fps = capture.get(videoio::CAP_PROP_FPS)?;
        let frame_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let frame_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        let total_frames = capture.get(videoio::CAP_PROP_FRAME_COUNT)? as i32;

        // Side-by-side exports carry both eyes in one frame
        let view_width = if stereo_side_by_side {
            frame_width / 2
        } else {
            frame_width
        };

        logger::info(&format!(
            "Opened {}: {}x{} @ {:.2} fps, {} frames",
            path.display(),
            frame_width,
            frame_height,
            fps,
            total_frames
        ));

        Ok(Self {
            capture,
            path: path.to_path_buf(),
            props: SourceProperties::new(view_width, frame_height, fps, total_frames),
            stereo_side_by_side,
            current: Mat::default(),
            next_index: 0,
        })
    }

    fn half(&self, left: bool) -> Result<Mat> {
        let w = self.props.width;
        let h = self.props.height;
        let x = if left { 0 } else { w };
        let roi = Mat::roi(&self.current, Rect::new(x, 0, w, h))?;
        Ok(roi.try_clone()?)
    }
}

impl FrameSource for VideoSource {
    fn properties(&self) -> SourceProperties {
        self.props.clone()
    }

    fn provides_measures(&self) -> bool {
        false
    }

    fn grab(&mut self) -> Result<bool> {
        let mut frame = Mat::default();
        let ok = self
            .capture
            .read(&mut frame)
            .with_context(|| format!("Read failed on {}", self.path.display()))?;
        if !ok || frame.empty() {
            return Ok(false);
        }
        // VideoWriter and the pipeline expect 3-channel BGR
        if frame.channels() == 4 {
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&frame, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
            self.current = bgr;
        } else {
            self.current = frame;
        }
        self.next_index += 1;
        Ok(true)
    }

    fn retrieve_image(&mut self, view: View) -> Result<Mat> {
        if self.current.empty() {
            bail!("No frame grabbed from {}", self.path.display());
        }
        if self.stereo_side_by_side {
            match view {
                View::Left => self.half(true),
                View::Right => self.half(false),
                View::SideBySide => Ok(self.current.try_clone()?),
            }
        } else {
            match view {
                View::Left => Ok(self.current.try_clone()?),
                View::Right | View::SideBySide => {
                    bail!(
                        "{:?} view requires a side-by-side stereo recording (--stereo)",
                        view
                    )
                }
            }
        }
    }

    fn retrieve_measure(&mut self, measure: Measure) -> Result<Mat> {
        bail!(
            "{:?} measures are not available from a plain video container; \
             use an extraction dataset directory or an SDK-backed reader",
            measure
        )
    }

    fn seek(&mut self, frame_index: i32) -> Result<()> {
        if frame_index < 0 || (self.props.total_frames > 0 && frame_index >= self.props.total_frames)
        {
            bail!("Frame index out of range: {}", frame_index);
        }
        self.capture
            .set(videoio::CAP_PROP_POS_FRAMES, frame_index as f64)?;
        self.next_index = frame_index;
        Ok(())
    }

    fn current_position(&self) -> i32 {
        self.next_index - 1
    }

    fn close(&mut self) {
        let _ = self.capture.release();
        self.current = Mat::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_names_path() {
        let err = VideoSource::open(Path::new("/nonexistent/flight.svo2"), false)
            .err()
            .expect("open must fail");
        assert!(err.to_string().contains("/nonexistent/flight.svo2"));
    }
}
