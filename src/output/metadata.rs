use crate::depth::colorize::LegendInfo;
use crate::depth::stats::DistanceSummary;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

pub fn current_datetime() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

/// Flight identity parsed from the `flight_YYYYMMDD_HHMMSS` folder holding
/// the recording.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlightInfo {
    pub folder_name: String,
    pub flight_date: String,
    pub flight_time: String,
    pub svo_file: String,
}

impl FlightInfo {
    pub fn from_recording(svo_path: &Path) -> Self {
        let folder_name = svo_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (flight_date, flight_time) = parse_flight_timestamp(&folder_name).unwrap_or_default();
        Self {
            folder_name,
            flight_date,
            flight_time,
            svo_file: svo_path.to_string_lossy().to_string(),
        }
    }
}

fn parse_flight_timestamp(folder: &str) -> Option<(String, String)> {
    let rest = folder.strip_prefix("flight_")?;
    let (date, time) = rest.split_once('_')?;
    if date.len() != 8
        || time.len() != 6
        || !date.chars().all(|c| c.is_ascii_digit())
        || !time.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some((
        format!("{}-{}-{}", &date[0..4], &date[4..6], &date[6..8]),
        format!("{}:{}:{}", &time[0..2], &time[2..4], &time[4..6]),
    ))
}

#[derive(Debug, Serialize)]
pub struct FrameMetadata {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub extraction_datetime: String,
    #[serde(flatten)]
    pub flight: FlightInfo,
    pub width: i32,
    pub height: i32,
    pub source_fps: f64,
    pub total_source_frames: i32,
    pub camera_mode: String,
    pub image_format: String,
    pub extraction_rate_fps: f32,
    pub frame_skip: usize,
    pub total_extracted_frames: usize,
    pub starting_frame_number: u32,
    pub ending_frame_number: u32,
    pub output_directory: String,
}

#[derive(Debug, Serialize)]
pub struct VideoMetadata {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub extraction_datetime: String,
    #[serde(flatten)]
    pub flight: FlightInfo,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub total_frames: i32,
    pub duration_seconds: f64,
    pub camera_mode: String,
    pub video_codec: String,
    pub output_files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DepthMetadata {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub extraction_datetime: String,
    #[serde(flatten)]
    pub flight: FlightInfo,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub output_fps: f64,
    pub total_frames: i32,
    pub frames_extracted: usize,
    pub min_depth_meters: f32,
    pub max_depth_meters: f32,
    pub auto_contrast: bool,
    pub log_scale: bool,
    pub edge_boost: bool,
    pub clahe: bool,
    pub temporal_smooth: bool,
    pub motion_highlight: bool,
    pub show_overlay: bool,
    pub overlay_strength: u8,
    pub confidence_threshold: u8,
    pub color_map: String,
    pub raw_format: String,
    pub statistics: DistanceSummary,
    /// Mapping actually applied to the last processed frame.
    pub legend: Option<LegendInfo>,
    pub output_video: Option<String>,
}
