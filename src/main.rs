mod depth;
mod extract;
mod output;
mod shared;
mod source;
mod utils;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::depth::{ColorMapKind, RawDepthFormat, VisualizationConfig};
use crate::extract::engine::spawn_run;
use crate::extract::{
    CameraMode, DepthExtractionConfig, ExtractionEngine, ExtractionResult, FrameExtractionConfig,
    ImageFormat, ProgressEvent, SourceFactory, VideoExtractionConfig, VideoLayout,
};

#[derive(Parser)]
#[command(author, version, about = "Frame, video and depth extraction from stereo-camera SVO2 recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample camera frames into the ML dataset tree
    Frames {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long, help = "Base output directory (defaults to the user video folder)")]
        output: Option<PathBuf>,
        #[arg(short, long, default_value_t = 1.0)]
        fps: f32,
        #[arg(short, long, value_enum, default_value_t = CameraMode::Left)]
        mode: CameraMode,
        #[arg(long, value_enum, default_value_t = ImageFormat::Png)]
        format: ImageFormat,
        #[arg(long, help = "Treat the recording as a side-by-side stereo export")]
        stereo: bool,
    },
    /// Re-encode the recording into MJPG .avi files
    Video {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = VideoLayout::Left)]
        layout: VideoLayout,
        #[arg(short, long, default_value_t = 0.0, help = "Output FPS, 0 keeps the source rate")]
        fps: f32,
        #[arg(long)]
        stereo: bool,
    },
    /// Extract raw depth, colorized heatmaps and confidence maps
    Depth {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, default_value_t = 1.0)]
        fps: f32,
        #[arg(long, default_value_t = 10.0)]
        min_depth: f32,
        #[arg(long, default_value_t = 50.0)]
        max_depth: f32,
        #[arg(long, help = "Stretch the range to the 2nd..98th percentile per frame")]
        auto_contrast: bool,
        #[arg(long)]
        log_scale: bool,
        #[arg(long)]
        edge_boost: bool,
        #[arg(long, default_value_t = 0.35)]
        edge_boost_factor: f32,
        #[arg(long)]
        clahe: bool,
        #[arg(long, value_enum, default_value_t = ColorMapKind::Turbo)]
        color_map: ColorMapKind,
        #[arg(long, default_value_t = 100, help = "Drop pixels with confidence above this (0 best, 100 worst)")]
        confidence: u8,
        #[arg(long)]
        temporal_smooth: bool,
        #[arg(long, default_value_t = 0.4)]
        smooth_alpha: f32,
        #[arg(long)]
        motion_highlight: bool,
        #[arg(long, default_value_t = 0.6)]
        motion_gain: f32,
        #[arg(long, help = "Blend the heatmap over the left RGB image")]
        overlay: bool,
        #[arg(long, default_value_t = 60)]
        overlay_strength: u8,
        #[arg(long, value_enum, default_value_t = RawDepthFormat::Tiff)]
        raw_format: RawDepthFormat,
        #[arg(long, help = "Skip raw depth files")]
        no_raw: bool,
        #[arg(long)]
        save_rgb: bool,
        #[arg(long)]
        save_confidence: bool,
        #[arg(long, help = "Skip heatmap PNGs")]
        no_heatmaps: bool,
        #[arg(long, help = "Also write an aggregated heatmap video")]
        video: bool,
        #[arg(long, help = "Do not retain previews in memory")]
        no_previews: bool,
        #[arg(long, default_value_t = shared::constants::DEFAULT_PREVIEW_MAX_WIDTH)]
        preview_width: i32,
        #[arg(long)]
        stereo: bool,
    },
    /// Print recording properties as JSON
    Probe {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        stereo: bool,
    },
    /// List SVO2 recordings under a directory
    Scan {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

fn default_output_base() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ZED_Recordings_Output")
}

fn source_factory(input: PathBuf, stereo: bool) -> SourceFactory {
    Box::new(move || source::open_auto(&input, stereo))
}

/// Runs the job on a worker thread and keeps this thread on progress
/// display and Ctrl-C handling, mirroring how a frontend would drive the
/// engine.
fn drive<F>(engine: Arc<ExtractionEngine>, job: F) -> Result<()>
where
    F: FnOnce(&dyn Fn(f32, &str)) -> ExtractionResult + Send + 'static,
{
    let cancel_engine = Arc::clone(&engine);
    ctrlc::set_handler(move || {
        eprintln!("\nCancellation requested...");
        cancel_engine.cancel();
    })?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = spawn_run(tx, job);

    let mut outcome = None;
    for event in rx.iter() {
        match event {
            ProgressEvent::Update { progress, message } => {
                println!("[{:5.1}%] {}", progress * 100.0, message);
            }
            ProgressEvent::Finished(result) => {
                outcome = Some(result);
                break;
            }
        }
    }
    handle.join().ok();

    let result = outcome.unwrap_or_else(|| ExtractionResult::failure("Worker thread died"));
    if result.cancelled {
        println!(
            "Cancelled after {} frames; partial output kept{}",
            result.frames_processed,
            result
                .output_path
                .as_ref()
                .map(|p| format!(" at {}", p.display()))
                .unwrap_or_default()
        );
        return Ok(());
    }
    if !result.success {
        bail!(result.error.unwrap_or_else(|| "Extraction failed".to_string()));
    }
    println!(
        "Done: {} frames -> {}",
        result.frames_processed,
        result
            .output_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
    Ok(())
}

fn main() -> Result<()> {
    utils::logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Frames {
            input,
            output,
            fps,
            mode,
            format,
            stereo,
        } => {
            let cfg = FrameExtractionConfig {
                base_output: output.unwrap_or_else(default_output_base),
                fps,
                camera_mode: mode,
                format,
                stereo,
                input: input.clone(),
            };
            let engine = Arc::new(ExtractionEngine::new());
            let worker_engine = Arc::clone(&engine);
            drive(engine, move |progress| {
                extract::frames::run(
                    &worker_engine,
                    source_factory(input, stereo),
                    &cfg,
                    progress,
                )
            })?;
        }
        Commands::Video {
            input,
            output,
            layout,
            fps,
            stereo,
        } => {
            let cfg = VideoExtractionConfig {
                base_output: output.unwrap_or_else(default_output_base),
                layout,
                output_fps: fps,
                stereo,
                input: input.clone(),
            };
            let engine = Arc::new(ExtractionEngine::new());
            let worker_engine = Arc::clone(&engine);
            drive(engine, move |progress| {
                extract::video::run(
                    &worker_engine,
                    source_factory(input, stereo),
                    &cfg,
                    progress,
                )
            })?;
        }
        Commands::Depth {
            input,
            output,
            fps,
            min_depth,
            max_depth,
            auto_contrast,
            log_scale,
            edge_boost,
            edge_boost_factor,
            clahe,
            color_map,
            confidence,
            temporal_smooth,
            smooth_alpha,
            motion_highlight,
            motion_gain,
            overlay,
            overlay_strength,
            raw_format,
            no_raw,
            save_rgb,
            save_confidence,
            no_heatmaps,
            video,
            no_previews,
            preview_width,
            stereo,
        } => {
            let viz = VisualizationConfig {
                min_depth_m: min_depth,
                max_depth_m: max_depth,
                auto_contrast,
                confidence_threshold: confidence,
                log_scale,
                edge_boost,
                edge_boost_factor,
                use_clahe: clahe,
                color_map,
                temporal_smooth,
                smooth_alpha,
                motion_highlight,
                motion_gain,
                overlay_on_rgb: overlay,
                overlay_strength,
            };
            let cfg = DepthExtractionConfig {
                base_output: output.unwrap_or_else(default_output_base),
                output_fps: fps,
                viz,
                raw_format,
                save_raw: !no_raw,
                save_rgb,
                save_confidence,
                save_heatmaps: !no_heatmaps,
                save_video: video,
                keep_previews: !no_previews,
                preview_max_width: preview_width,
                stereo,
                input: input.clone(),
            };
            let engine = Arc::new(ExtractionEngine::new());
            let worker_engine = Arc::clone(&engine);
            drive(engine, move |progress| {
                extract::depth::run(
                    &worker_engine,
                    source_factory(input, stereo),
                    &cfg,
                    progress,
                )
            })?;
        }
        Commands::Probe { input, stereo } => {
            let probed = source::open_auto(&input, stereo)?;
            println!("{}", serde_json::to_string_pretty(&probed.properties())?);
        }
        Commands::Scan { dir } => {
            let found = utils::file_utils::scan_for_svo_files(&dir, true)?;
            if found.is_empty() {
                println!("No SVO/SVO2 recordings found under {}", dir.display());
            }
            for info in found {
                println!(
                    "{}  {}  {}",
                    info.path.display(),
                    info.formatted_size(),
                    if info.is_flight_folder {
                        info.parent_folder.as_str()
                    } else {
                        "(no flight folder)"
                    }
                );
            }
        }
    }

    Ok(())
}
