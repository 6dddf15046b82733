pub mod dataset;
pub mod video;

use anyhow::Result;
use opencv::core::Mat;
use serde::Serialize;
use std::path::Path;

pub use dataset::DatasetSource;
pub use video::VideoSource;

/// Which camera view to retrieve from the last grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Left,
    Right,
    SideBySide,
}

/// Which per-pixel measure to retrieve from the last grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// 32-bit float distance in meters, one value per pixel.
    Depth,
    /// 8-bit quality score, 0 = best, 100 = worst.
    Confidence,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceProperties {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub total_frames: i32,
    pub duration_seconds: f64,
}

impl SourceProperties {
    pub fn new(width: i32, height: i32, fps: f64, total_frames: i32) -> Self {
        let duration_seconds = if total_frames > 0 && fps > 0.0 {
            total_frames as f64 / fps
        } else {
            0.0
        };
        Self {
            width,
            height,
            fps,
            total_frames,
            duration_seconds,
        }
    }
}

/// Seam for the recording backends.
///
/// Mirrors the grab/retrieve surface of the stereo-camera SDK so an
/// SDK-backed SVO2 reader can plug in next to the shipped OpenCV and
/// dataset backends. Implementations own their handle and release it on
/// drop; `close` exists for early release.
pub trait FrameSource: Send {
    fn properties(&self) -> SourceProperties;

    /// Whether `retrieve_measure` can succeed at all for this backend.
    fn provides_measures(&self) -> bool;

    /// Advances to the next frame. `Ok(false)` is a clean end of stream;
    /// `Err` is a (possibly transient) read failure.
    fn grab(&mut self) -> Result<bool>;

    /// BGR 8-bit image for the requested view of the last grabbed frame.
    fn retrieve_image(&mut self, view: View) -> Result<Mat>;

    /// Float depth (CV_32FC1, meters) or byte confidence (CV_8UC1) for the
    /// last grabbed frame.
    fn retrieve_measure(&mut self, measure: Measure) -> Result<Mat>;

    /// Repositions so the next `grab` lands on `frame_index`.
    fn seek(&mut self, frame_index: i32) -> Result<()>;

    /// Index of the most recently grabbed frame, -1 before the first grab.
    fn current_position(&self) -> i32;

    fn close(&mut self) {}
}

/// Picks a backend from the path shape: directories are re-ingested
/// extraction datasets, files go through the OpenCV capture backend.
pub fn open_auto(path: &Path, stereo_side_by_side: bool) -> Result<Box<dyn FrameSource>> {
    if path.is_dir() {
        Ok(Box::new(DatasetSource::open(path)?))
    } else {
        Ok(Box::new(VideoSource::open(path, stereo_side_by_side)?))
    }
}
