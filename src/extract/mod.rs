pub mod depth;
pub mod engine;
pub mod frames;
pub mod video;

use crate::depth::{RawDepthFormat, VisualizationConfig};
use crate::shared::constants;
use crate::source::FrameSource;
use anyhow::Result;
use clap::ValueEnum;
use std::path::PathBuf;

pub use engine::{EngineState, ExtractionEngine, ExtractionResult, ProgressEvent};

/// Deferred source construction so runs can open their input on the worker
/// thread (and tests can substitute an in-memory source).
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CameraMode {
    Left,
    Right,
    Both,
}

impl CameraMode {
    pub fn label(self) -> &'static str {
        match self {
            CameraMode::Left => "left",
            CameraMode::Right => "right",
            CameraMode::Both => "both",
        }
    }

    pub fn wants_left(self) -> bool {
        matches!(self, CameraMode::Left | CameraMode::Both)
    }

    pub fn wants_right(self) -> bool {
        matches!(self, CameraMode::Right | CameraMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoLayout {
    Left,
    Right,
    BothSeparate,
    SideBySide,
}

impl VideoLayout {
    pub fn label(self) -> &'static str {
        match self {
            VideoLayout::Left => "left",
            VideoLayout::Right => "right",
            VideoLayout::BothSeparate => "both_separate",
            VideoLayout::SideBySide => "side_by_side",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImageFormat {
    Png,
    Jpg,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameExtractionConfig {
    pub input: PathBuf,
    pub base_output: PathBuf,
    /// Sampling rate; every round(source_fps / fps)-th frame is kept.
    pub fps: f32,
    pub camera_mode: CameraMode,
    pub format: ImageFormat,
    pub stereo: bool,
}

#[derive(Debug, Clone)]
pub struct VideoExtractionConfig {
    pub input: PathBuf,
    pub base_output: PathBuf,
    pub layout: VideoLayout,
    /// 0 keeps the source rate; values above it are clamped down.
    pub output_fps: f32,
    pub stereo: bool,
}

#[derive(Debug, Clone)]
pub struct DepthExtractionConfig {
    pub input: PathBuf,
    pub base_output: PathBuf,
    pub output_fps: f32,
    pub viz: VisualizationConfig,
    pub raw_format: RawDepthFormat,
    pub save_raw: bool,
    pub save_rgb: bool,
    pub save_confidence: bool,
    pub save_heatmaps: bool,
    pub save_video: bool,
    pub keep_previews: bool,
    pub preview_max_width: i32,
    pub stereo: bool,
}

impl Default for DepthExtractionConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            base_output: PathBuf::new(),
            output_fps: 1.0,
            viz: VisualizationConfig::default(),
            raw_format: RawDepthFormat::Tiff,
            save_raw: true,
            save_rgb: false,
            save_confidence: false,
            save_heatmaps: true,
            save_video: false,
            keep_previews: true,
            preview_max_width: constants::DEFAULT_PREVIEW_MAX_WIDTH,
            stereo: false,
        }
    }
}

/// Sampling interval for a requested output rate, never below 1.
pub fn frame_interval(source_fps: f64, requested_fps: f32) -> usize {
    if requested_fps <= 0.0 || source_fps <= 0.0 {
        return 1;
    }
    ((source_fps / requested_fps as f64).round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval() {
        assert_eq!(frame_interval(30.0, 1.0), 30);
        assert_eq!(frame_interval(30.0, 8.0), 4);
        assert_eq!(frame_interval(30.0, 60.0), 1);
        assert_eq!(frame_interval(30.0, 0.0), 1);
        assert_eq!(frame_interval(0.0, 5.0), 1);
    }
}
