pub mod codec;
pub mod colorize;
pub mod mask;
pub mod stats;
pub mod store;
pub mod temporal;

use clap::ValueEnum;
use opencv::imgproc;
use serde::Serialize;

/// Color map applied to the scaled depth image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMapKind {
    Turbo,
    Viridis,
    Plasma,
    Jet,
}

impl ColorMapKind {
    pub fn label(self) -> &'static str {
        match self {
            ColorMapKind::Turbo => "turbo",
            ColorMapKind::Viridis => "viridis",
            ColorMapKind::Plasma => "plasma",
            ColorMapKind::Jet => "jet",
        }
    }

    pub fn to_opencv(self) -> i32 {
        match self {
            ColorMapKind::Turbo => imgproc::COLORMAP_TURBO,
            ColorMapKind::Viridis => imgproc::COLORMAP_VIRIDIS,
            ColorMapKind::Plasma => imgproc::COLORMAP_PLASMA,
            ColorMapKind::Jet => imgproc::COLORMAP_JET,
        }
    }
}

/// On-disk representation for raw float depth frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RawDepthFormat {
    /// 32-bit float TIFF, the most portable of the four.
    Tiff,
    /// Portable Float Map, little-endian.
    Pfm,
    /// OpenEXR; unavailable in some OpenCV builds.
    Exr,
    /// Headerless width*height float32 dump.
    Bin,
}

impl RawDepthFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RawDepthFormat::Tiff => "tiff",
            RawDepthFormat::Pfm => "pfm",
            RawDepthFormat::Exr => "exr",
            RawDepthFormat::Bin => "bin",
        }
    }
}

/// How to turn one depth frame into a color image. Immutable per
/// invocation; the transform never writes back into it.
#[derive(Debug, Clone)]
pub struct VisualizationConfig {
    pub min_depth_m: f32,
    pub max_depth_m: f32,
    pub auto_contrast: bool,
    /// Pixels with confidence above this are masked out (0 best, 100 worst).
    pub confidence_threshold: u8,
    pub log_scale: bool,
    pub edge_boost: bool,
    pub edge_boost_factor: f32,
    pub use_clahe: bool,
    pub color_map: ColorMapKind,
    pub temporal_smooth: bool,
    pub smooth_alpha: f32,
    pub motion_highlight: bool,
    pub motion_gain: f32,
    pub overlay_on_rgb: bool,
    /// Heatmap share of the blend, in percent.
    pub overlay_strength: u8,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            min_depth_m: 10.0,
            max_depth_m: 50.0,
            auto_contrast: false,
            confidence_threshold: 100,
            log_scale: false,
            edge_boost: false,
            edge_boost_factor: 0.35,
            use_clahe: false,
            color_map: ColorMapKind::Turbo,
            temporal_smooth: false,
            smooth_alpha: 0.4,
            motion_highlight: false,
            motion_gain: 0.6,
            overlay_on_rgb: false,
            overlay_strength: 60,
        }
    }
}

/// The meter bounds a frame was actually scaled with, after any
/// auto-contrast adjustment. Callers need it for legends and metadata;
/// it can differ from the configured range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectiveRange {
    pub near_m: f32,
    pub far_m: f32,
}

impl EffectiveRange {
    /// Degenerate ranges are nudged apart so near < far always holds.
    pub fn normalized(near_m: f32, far_m: f32) -> Self {
        let far_m = if far_m > near_m {
            far_m
        } else {
            near_m + crate::shared::constants::RANGE_DEGENERATE_NUDGE_M
        };
        Self { near_m, far_m }
    }
}
