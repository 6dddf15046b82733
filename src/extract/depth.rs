use super::engine::{ExtractionEngine, ExtractionResult};
use super::frames::write_image;
use super::video::open_writer;
use super::{frame_interval, DepthExtractionConfig, SourceFactory};
use crate::depth::codec::{self, DepthCodec};
use crate::depth::colorize::{colorize, legend_strip, LegendInfo};
use crate::depth::stats::{self, RunStatistics};
use crate::depth::store::{downscale_preview, RunContext};
use crate::depth::temporal::{apply_motion_highlight, TemporalState};
use crate::depth::VisualizationConfig;
use crate::output::metadata::{self, DepthMetadata, FlightInfo};
use crate::output::OutputManager;
use crate::shared::constants;
use crate::source::{self, FrameSource, Measure, View};
use crate::utils::{file_utils, logger};
use anyhow::{anyhow, bail, Context, Result};
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use std::path::{Path, PathBuf};

fn depth_map_path(extraction_dir: &Path, index: usize, format: crate::depth::RawDepthFormat) -> PathBuf {
    extraction_dir
        .join(constants::DEPTH_MAPS_DIR)
        .join(format!("depth_{:06}.{}", index, format.extension()))
}

fn heatmap_path(extraction_dir: &Path, index: usize) -> PathBuf {
    extraction_dir
        .join(constants::HEATMAPS_DIR)
        .join(format!("heatmap_{:06}.png", index))
}

fn rgb_path(extraction_dir: &Path, index: usize) -> PathBuf {
    extraction_dir
        .join(constants::LEFT_RGB_DIR)
        .join(format!("left_{:06}.png", index))
}

fn confidence_path(extraction_dir: &Path, index: usize) -> PathBuf {
    extraction_dir
        .join(constants::CONFIDENCE_MAPS_DIR)
        .join(format!("conf_{:06}.png", index))
}

/// The depth pipeline run: for every retained frame, mask, colorize and
/// persist the configured side effects, feeding the frame store and the
/// live preview as it goes.
pub fn run(
    engine: &ExtractionEngine,
    factory: SourceFactory,
    cfg: &DepthExtractionConfig,
    progress: &dyn Fn(f32, &str),
) -> ExtractionResult {
    let Some(guard) = engine.try_begin() else {
        return ExtractionResult::failure("Extraction already in progress");
    };

    progress(0.0, "Opening recording...");
    let mut source = match factory() {
        Ok(s) => s,
        Err(e) => {
            let result = ExtractionResult::failure(format!(
                "Failed to open {}: {}",
                cfg.input.display(),
                e
            ));
            guard.finish(&result);
            return result;
        }
    };
    let props = source.properties();
    if !source.provides_measures() {
        let result = ExtractionResult::failure(format!(
            "{} provides no depth measures; depth extraction needs an extraction dataset \
             directory or an SDK-backed reader",
            cfg.input.display()
        ));
        guard.finish(&result);
        return result;
    }
    progress(0.05, "Recording opened");

    let flight = file_utils::flight_folder_for(&cfg.input);
    progress(0.08, &format!("Detected flight: {}", flight));

    let out_mgr = OutputManager::new(&cfg.base_output);
    let extraction_dir = match out_mgr
        .validate_base()
        .and_then(|_| out_mgr.create_extraction_dir(&flight))
    {
        Ok(dir) => dir,
        Err(e) => {
            let result =
                ExtractionResult::failure(format!("Failed to create extraction directory: {}", e));
            guard.finish(&result);
            return result;
        }
    };

    let subdirs = [
        (cfg.save_raw, constants::DEPTH_MAPS_DIR),
        (cfg.save_heatmaps, constants::HEATMAPS_DIR),
        (cfg.save_rgb, constants::LEFT_RGB_DIR),
        (cfg.save_confidence, constants::CONFIDENCE_MAPS_DIR),
    ];
    for (wanted, name) in subdirs {
        if !wanted {
            continue;
        }
        if let Err(e) = OutputManager::ensure_dir(&extraction_dir.join(name)) {
            let result = ExtractionResult::failure(e.to_string());
            guard.finish(&result);
            return result;
        }
    }
    progress(0.1, "Output directory created");

    let mut video_writer = None;
    if cfg.save_video {
        let effective_fps = if cfg.output_fps > 0.0 {
            (cfg.output_fps as f64).min(props.fps.max(1.0))
        } else {
            props.fps.max(1.0)
        };
        match open_writer(
            &extraction_dir.join(constants::HEATMAP_VIDEO_FILE),
            effective_fps,
            Size::new(props.width, props.height),
        ) {
            Ok(writer) => video_writer = Some(writer),
            Err(e) => {
                let result = ExtractionResult::failure(e.to_string());
                guard.finish(&result);
                return result;
            }
        }
    }

    engine.store().begin_run(RunContext {
        extraction_dir: extraction_dir.clone(),
        source_path: cfg.input.clone(),
        raw_format: cfg.raw_format,
        stereo: cfg.stereo,
        width: props.width,
        height: props.height,
        preview_max_width: cfg.preview_max_width,
    });
    match legend_strip(cfg.viz.color_map) {
        Ok(strip) => {
            if let Err(e) = engine.store().set_legend(&strip) {
                logger::warn(&format!("Failed to publish legend: {}", e));
            }
        }
        Err(e) => logger::warn(&format!("Failed to render legend: {}", e)),
    }

    let interval = frame_interval(props.fps, cfg.output_fps);
    let codec = DepthCodec::new();
    let mut temporal = TemporalState::new(cfg.viz.smooth_alpha);
    let mut run_stats = RunStatistics::new();
    let mut last_legend: Option<LegendInfo> = None;

    let need_rgb = cfg.save_rgb || cfg.viz.overlay_on_rgb;
    let mut svo_position = 0usize;
    let mut extracted = 0usize;
    let mut consecutive_errors = 0usize;

    guard.mark_running();
    loop {
        if engine.should_cancel() {
            if let Some(writer) = video_writer.as_mut() {
                let _ = writer.release();
            }
            source.close();
            let result = ExtractionResult::cancelled(Some(extraction_dir), extracted);
            guard.finish(&result);
            return result;
        }

        match source.grab() {
            Ok(true) => consecutive_errors = 0,
            Ok(false) => break,
            Err(e) => {
                consecutive_errors += 1;
                logger::warn(&format!("Frame grab error: {}", e));
                if consecutive_errors >= constants::MAX_CONSECUTIVE_GRAB_ERRORS {
                    if let Some(writer) = video_writer.as_mut() {
                        let _ = writer.release();
                    }
                    let result = ExtractionResult::failure(format!(
                        "Aborted after {} consecutive grab errors (last: {})",
                        consecutive_errors, e
                    ));
                    guard.finish(&result);
                    return result;
                }
                continue;
            }
        }

        if svo_position % interval != 0 {
            svo_position += 1;
            continue;
        }
        let source_frame = source.current_position();

        let depth = match source.retrieve_measure(Measure::Depth) {
            Ok(depth) => depth,
            Err(e) => {
                logger::warn(&format!("Skipping frame {}: no depth ({})", svo_position, e));
                svo_position += 1;
                continue;
            }
        };
        let confidence = source.retrieve_measure(Measure::Confidence).ok();
        let rgb = if need_rgb {
            source.retrieve_image(View::Left).ok()
        } else {
            None
        };

        if let Err(e) = process_frame(
            engine,
            cfg,
            &codec,
            &mut temporal,
            &mut run_stats,
            &mut last_legend,
            video_writer.as_mut(),
            &extraction_dir,
            extracted,
            source_frame,
            &depth,
            confidence.as_ref(),
            rgb.as_ref(),
        ) {
            logger::warn(&format!("Frame {} failed: {}", svo_position, e));
            svo_position += 1;
            continue;
        }

        extracted += 1;
        svo_position += 1;

        if extracted % constants::PROGRESS_FRAME_INTERVAL == 0 {
            let fraction = if props.total_frames > 0 {
                svo_position as f32 / props.total_frames as f32
            } else {
                0.0
            };
            progress(
                0.1 + 0.9 * fraction.min(1.0),
                &format!("Processing depth: {} frames", extracted),
            );
        }
    }
    if let Some(writer) = video_writer.as_mut() {
        let _ = writer.release();
    }
    source.close();

    if extracted == 0 {
        let result = ExtractionResult::failure(format!(
            "No frames extracted from {}; check that the path points to a valid SVO2 recording",
            cfg.input.display()
        ));
        guard.finish(&result);
        return result;
    }

    let meta = DepthMetadata {
        kind: "depth_analysis",
        extraction_datetime: metadata::current_datetime(),
        flight: FlightInfo::from_recording(&cfg.input),
        width: props.width,
        height: props.height,
        fps: props.fps,
        output_fps: if cfg.output_fps > 0.0 {
            cfg.output_fps as f64
        } else {
            props.fps
        },
        total_frames: props.total_frames,
        frames_extracted: extracted,
        min_depth_meters: cfg.viz.min_depth_m,
        max_depth_meters: cfg.viz.max_depth_m,
        auto_contrast: cfg.viz.auto_contrast,
        log_scale: cfg.viz.log_scale,
        edge_boost: cfg.viz.edge_boost,
        clahe: cfg.viz.use_clahe,
        temporal_smooth: cfg.viz.temporal_smooth,
        motion_highlight: cfg.viz.motion_highlight,
        show_overlay: cfg.viz.overlay_on_rgb,
        overlay_strength: cfg.viz.overlay_strength,
        confidence_threshold: cfg.viz.confidence_threshold,
        color_map: cfg.viz.color_map.label().to_string(),
        raw_format: cfg.raw_format.extension().to_string(),
        statistics: run_stats.summary(),
        legend: last_legend,
        output_video: cfg
            .save_video
            .then(|| constants::HEATMAP_VIDEO_FILE.to_string()),
    };
    if let Err(e) = metadata::save_json(&meta, &extraction_dir.join(constants::DEPTH_METADATA_FILE))
    {
        logger::warn(&format!("Failed to save depth metadata: {}", e));
    }

    progress(1.0, "Depth extraction completed");
    let result = ExtractionResult::completed(extraction_dir, extracted);
    guard.finish(&result);
    result
}

/// One frame through the pipeline: temporal smoothing, colorize, motion
/// highlight, then every enabled side effect. An error here skips the
/// frame, never the run.
#[allow(clippy::too_many_arguments)]
fn process_frame(
    engine: &ExtractionEngine,
    cfg: &DepthExtractionConfig,
    codec: &DepthCodec,
    temporal: &mut TemporalState,
    run_stats: &mut RunStatistics,
    last_legend: &mut Option<LegendInfo>,
    video_writer: Option<&mut opencv::videoio::VideoWriter>,
    extraction_dir: &Path,
    index: usize,
    source_frame: i32,
    depth: &Mat,
    confidence: Option<&Mat>,
    rgb: Option<&Mat>,
) -> Result<()> {
    let vis_input = temporal.visualization_input(depth, cfg.viz.temporal_smooth)?;
    let (mut heat, range) = colorize(&vis_input, confidence, rgb, &cfg.viz)?;
    if heat.empty() {
        temporal.advance(&vis_input)?;
        bail!("visualization produced an empty frame");
    }

    if cfg.viz.motion_highlight {
        if let Some(mask) = temporal.motion_mask(&vis_input)? {
            apply_motion_highlight(&mut heat, &mask, cfg.viz.motion_gain)?;
        }
    }
    temporal.advance(&vis_input)?;

    // The raw, unsmoothed depth is what goes to disk and statistics
    run_stats.record(&stats::frame_stats(
        depth,
        cfg.viz.min_depth_m,
        cfg.viz.max_depth_m,
    )?);

    if cfg.save_raw {
        codec.write_frame(
            depth,
            &depth_map_path(extraction_dir, index, cfg.raw_format),
            cfg.raw_format,
        );
    }
    if cfg.save_confidence {
        if let Some(conf) = confidence {
            if let Err(e) = write_image(&confidence_path(extraction_dir, index), conf) {
                logger::warn(&format!("Confidence write failed: {}", e));
            }
        }
    }
    if cfg.save_rgb {
        if let Some(rgb) = rgb {
            if let Err(e) = write_image(&rgb_path(extraction_dir, index), rgb) {
                logger::warn(&format!("RGB write failed: {}", e));
            }
        }
    }
    if cfg.save_heatmaps {
        if let Err(e) = write_image(&heatmap_path(extraction_dir, index), &heat) {
            logger::warn(&format!("Heatmap write failed: {}", e));
        }
    }
    if let Some(writer) = video_writer {
        if let Err(e) = writer.write(&heat) {
            logger::warn(&format!("Heatmap video write failed: {}", e));
        }
    }

    let preview = if cfg.keep_previews {
        match downscale_preview(&heat, cfg.preview_max_width) {
            Ok(p) => Some(p),
            Err(e) => {
                logger::warn(&format!("Preview downscale failed: {}", e));
                None
            }
        }
    } else {
        None
    };
    engine.store().push_preview(preview, source_frame);

    let info = LegendInfo::new(range, &cfg.viz);
    *last_legend = Some(info.clone());
    if let Err(e) = engine.store().set_live_preview(&heat, info) {
        logger::warn(&format!("Live preview update failed: {}", e));
    }
    Ok(())
}

/// Re-runs masking and colorization for one historical frame with a
/// possibly changed configuration, outside any temporal/motion state.
///
/// The depth (and, independently, confidence and RGB) is resolved from the
/// saved raw files first, falling back to re-opening the source and
/// seeking to the frame's original position. Updates the stored preview
/// and the live preview in place; other entries are untouched.
pub fn reprocess_frame(
    engine: &ExtractionEngine,
    index: usize,
    viz: &VisualizationConfig,
    overwrite_heatmap: bool,
) -> Result<Mat> {
    let ctx = engine
        .store()
        .run_context()
        .ok_or_else(|| anyhow!("No extraction run to re-process"))?;
    let entry = engine
        .store()
        .entry(index)
        .ok_or_else(|| anyhow!("No stored frame with index {}", index))?;

    let mut reopened: Option<Box<dyn FrameSource>> = None;

    let depth = match codec::read(
        &depth_map_path(&ctx.extraction_dir, index, ctx.raw_format),
        ctx.raw_format,
        Some((ctx.height, ctx.width)),
    ) {
        Ok(depth) => depth,
        Err(disk_err) => {
            let src = reopen(&ctx, entry.source_frame, &mut reopened).with_context(|| {
                format!(
                    "Frame {} unrecoverable: no raw depth on disk ({})",
                    index, disk_err
                )
            })?;
            src.retrieve_measure(Measure::Depth)?
        }
    };

    let confidence = read_gray(&confidence_path(&ctx.extraction_dir, index)).or_else(|| {
        reopen(&ctx, entry.source_frame, &mut reopened)
            .and_then(|src| src.retrieve_measure(Measure::Confidence))
            .ok()
    });

    let rgb = if viz.overlay_on_rgb {
        read_color(&rgb_path(&ctx.extraction_dir, index)).or_else(|| {
            reopen(&ctx, entry.source_frame, &mut reopened)
                .and_then(|src| src.retrieve_image(View::Left))
                .ok()
        })
    } else {
        None
    };

    let (heat, range) = colorize(&depth, confidence.as_ref(), rgb.as_ref(), viz)?;
    if heat.empty() {
        bail!("Re-processing frame {} produced an empty image", index);
    }

    if overwrite_heatmap {
        let path = heatmap_path(&ctx.extraction_dir, index);
        if path.parent().map(|p| p.is_dir()).unwrap_or(false) {
            if let Err(e) = write_image(&path, &heat) {
                logger::warn(&format!("Heatmap overwrite failed: {}", e));
            }
        }
    }

    match downscale_preview(&heat, ctx.preview_max_width) {
        Ok(preview) => {
            engine.store().update_entry(index, preview);
        }
        Err(e) => logger::warn(&format!("Preview downscale failed: {}", e)),
    }
    engine
        .store()
        .set_live_preview(&heat, LegendInfo::new(range, viz))?;

    Ok(heat)
}

/// Opens the original source once and positions it on the frame; later
/// calls reuse the handle.
fn reopen<'a>(
    ctx: &RunContext,
    source_frame: i32,
    slot: &'a mut Option<Box<dyn FrameSource>>,
) -> Result<&'a mut Box<dyn FrameSource>> {
    if slot.is_none() {
        let mut src = source::open_auto(&ctx.source_path, ctx.stereo)?;
        src.seek(source_frame)?;
        if !src.grab()? {
            bail!(
                "Could not re-grab frame {} from {}",
                source_frame,
                ctx.source_path.display()
            );
        }
        *slot = Some(src);
    }
    slot.as_mut()
        .ok_or_else(|| anyhow!("source re-open failed"))
}

fn read_gray(path: &Path) -> Option<Mat> {
    let path_str = path.to_str()?;
    let mat = opencv::imgcodecs::imread(path_str, opencv::imgcodecs::IMREAD_GRAYSCALE).ok()?;
    (!mat.empty()).then_some(mat)
}

fn read_color(path: &Path) -> Option<Mat> {
    let path_str = path.to_str()?;
    let mat = opencv::imgcodecs::imread(path_str, opencv::imgcodecs::IMREAD_COLOR).ok()?;
    (!mat.empty()).then_some(mat)
}
