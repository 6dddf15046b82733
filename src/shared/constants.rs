pub const APP_NAME: &str = "svo-extract";

pub const ERROR_LOG_FILE: &str = "error.log";
pub const DEBUG_LOG_FILE: &str = "debug.log";

pub const SVO_EXTENSIONS: &[&str] = &["svo", "svo2"];
pub const VIDEO_EXTENSIONS: &[&str] = &["avi", "mp4", "mkv", "mov"];

// Output tree layout
pub const EXTRACTIONS_DIR: &str = "Extractions";
pub const YOLO_TRAINING_DIR: &str = "Yolo_Training";
pub const UNFILTERED_IMAGES_DIR: &str = "Unfiltered_Images";
pub const FRAME_COUNTER_FILE: &str = ".frame_counter.json";

pub const DEPTH_MAPS_DIR: &str = "depth_maps";
pub const HEATMAPS_DIR: &str = "depth_heatmaps";
pub const LEFT_RGB_DIR: &str = "left_rgb";
pub const CONFIDENCE_MAPS_DIR: &str = "confidence_maps";
pub const HEATMAP_VIDEO_FILE: &str = "depth_heatmap.avi";
pub const DEPTH_METADATA_FILE: &str = "depth_metadata.json";

pub const UNKNOWN_FLIGHT: &str = "unknown_flight";

// Depth visualization pipeline
pub const AUTO_CONTRAST_LOW_PERCENTILE: f32 = 2.0;
pub const AUTO_CONTRAST_HIGH_PERCENTILE: f32 = 98.0;
pub const AUTO_CONTRAST_MIN_SAMPLES: usize = 100;
pub const AUTO_CONTRAST_MIN_SPREAD_M: f32 = 0.5;
pub const LOG_SCALE_EPSILON: f32 = 1e-3;
pub const RANGE_DEGENERATE_NUDGE_M: f32 = 1e-3;
pub const MIN_VALID_PIXEL_FLOOR: usize = 1000;
pub const CLAHE_CLIP_LIMIT: f64 = 2.0;
pub const CLAHE_TILE_GRID: i32 = 8;
pub const MOTION_DIFF_THRESHOLD: f32 = 0.15;
pub const LEGEND_WIDTH: i32 = 256;
pub const LEGEND_HEIGHT: i32 = 16;

// Orchestrator policy
pub const PROGRESS_FRAME_INTERVAL: usize = 10;
pub const MAX_CONSECUTIVE_GRAB_ERRORS: usize = 50;
pub const DEFAULT_PREVIEW_MAX_WIDTH: i32 = 640;
