use super::engine::{ExtractionEngine, ExtractionResult};
use super::{SourceFactory, VideoExtractionConfig, VideoLayout};
use crate::output::metadata::{self, FlightInfo, VideoMetadata};
use crate::output::OutputManager;
use crate::shared::constants;
use crate::source::View;
use crate::utils::{file_utils, logger};
use anyhow::{anyhow, bail, Result};
use opencv::core::{self, Mat, Size};
use opencv::prelude::*;
use opencv::videoio;
use std::path::Path;

/// MJPEG is encoded by OpenCV's built-in writer, so the output plays
/// everywhere without external codecs. Files are larger than H.264 but the
/// run never fails on a missing encoder.
pub(crate) fn open_writer(path: &Path, fps: f64, size: Size) -> Result<videoio::VideoWriter> {
    let fourcc = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G')?;
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))?;
    let writer = videoio::VideoWriter::new(path_str, fourcc, fps, size, true)?;
    if !writer.is_opened()? {
        bail!("Failed to create video writer for {}", path.display());
    }
    Ok(writer)
}

/// Re-encodes the recording into MJPG `.avi` files, one per requested
/// view, at the full source frame rate.
pub fn run(
    engine: &ExtractionEngine,
    factory: SourceFactory,
    cfg: &VideoExtractionConfig,
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
    progress(0.1, "Output directory created");

    let mut output_fps = props.fps;
    if cfg.output_fps > 0.0 {
        output_fps = cfg.output_fps as f64;
        if output_fps > props.fps {
            progress(
                0.12,
                &format!(
                    "Requested FPS ({:.1}) exceeds source FPS ({:.1}), using source FPS",
                    output_fps, props.fps
                ),
            );
            output_fps = props.fps;
        }
    }

    let write_left = matches!(cfg.layout, VideoLayout::Left | VideoLayout::BothSeparate);
    let write_right = matches!(cfg.layout, VideoLayout::Right | VideoLayout::BothSeparate);
    let write_sbs = cfg.layout == VideoLayout::SideBySide;
    let frame_size = Size::new(props.width, props.height);
    let sbs_size = Size::new(props.width * 2, props.height);

    let mut left_writer = None;
    let mut right_writer = None;
    let mut sbs_writer = None;
    for (wanted, name, size, slot) in [
        (write_left, "video_left.avi", frame_size, &mut left_writer),
        (write_right, "video_right.avi", frame_size, &mut right_writer),
        (write_sbs, "video_side_by_side.avi", sbs_size, &mut sbs_writer),
    ] {
        if !wanted {
            continue;
        }
        match open_writer(&extraction_dir.join(name), output_fps, size) {
            Ok(writer) => *slot = Some((writer, name.to_string())),
            Err(e) => {
                let result = ExtractionResult::failure(e.to_string());
                guard.finish(&result);
                return result;
            }
        }
    }
    progress(0.15, "Video writers initialized");

    let mut frame_count = 0usize;
    let mut consecutive_errors = 0usize;

    guard.mark_running();
    loop {
        if engine.should_cancel() {
            release_all(&mut [&mut left_writer, &mut right_writer, &mut sbs_writer]);
            source.close();
            let result = ExtractionResult::cancelled(Some(extraction_dir), frame_count);
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
                    release_all(&mut [&mut left_writer, &mut right_writer, &mut sbs_writer]);
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

        let left = if write_left || write_sbs {
            match source.retrieve_image(View::Left) {
                Ok(image) => Some(image),
                Err(e) => {
                    logger::warn(&format!("Skipping frame {}: {}", frame_count, e));
                    None
                }
            }
        } else {
            None
        };
        let right = if write_right || write_sbs {
            match source.retrieve_image(View::Right) {
                Ok(image) => Some(image),
                Err(e) => {
                    logger::warn(&format!("Skipping frame {}: {}", frame_count, e));
                    None
                }
            }
        } else {
            None
        };

        if let (Some((writer, _)), Some(image)) = (left_writer.as_mut(), left.as_ref()) {
            if let Err(e) = writer.write(image) {
                logger::warn(&format!("Left video write failed: {}", e));
            }
        }
        if let (Some((writer, _)), Some(image)) = (right_writer.as_mut(), right.as_ref()) {
            if let Err(e) = writer.write(image) {
                logger::warn(&format!("Right video write failed: {}", e));
            }
        }
        if let (Some((writer, _)), Some(l), Some(r)) =
            (sbs_writer.as_mut(), left.as_ref(), right.as_ref())
        {
            let mut side_by_side = Mat::default();
            match core::hconcat2(l, r, &mut side_by_side) {
                Ok(()) => {
                    if let Err(e) = writer.write(&side_by_side) {
                        logger::warn(&format!("Side-by-side video write failed: {}", e));
                    }
                }
                Err(e) => logger::warn(&format!("hconcat failed: {}", e)),
            }
        }

        frame_count += 1;
        if frame_count % constants::PROGRESS_FRAME_INTERVAL == 0 {
            let fraction = if props.total_frames > 0 {
                frame_count as f32 / props.total_frames as f32
            } else {
                0.0
            };
            progress(
                0.15 + 0.85 * fraction.min(1.0),
                &format!("Processing: {}/{} frames", frame_count, props.total_frames),
            );
        }
    }

    let output_files: Vec<String> = [&left_writer, &right_writer, &sbs_writer]
        .iter()
        .filter_map(|slot| slot.as_ref().map(|(_, name)| name.clone()))
        .collect();
    release_all(&mut [&mut left_writer, &mut right_writer, &mut sbs_writer]);
    source.close();

    if frame_count == 0 {
        let result = ExtractionResult::failure(format!(
            "No frames extracted from {}; check that the path points to a valid SVO2 recording",
            cfg.input.display()
        ));
        guard.finish(&result);
        return result;
    }

    let meta = VideoMetadata {
        kind: "video_extraction",
        extraction_datetime: metadata::current_datetime(),
        flight: FlightInfo::from_recording(&cfg.input),
        width: props.width,
        height: props.height,
        fps: output_fps,
        total_frames: props.total_frames,
        duration_seconds: props.duration_seconds,
        camera_mode: cfg.layout.label().to_string(),
        video_codec: "mjpeg".to_string(),
        output_files,
    };
    if let Err(e) = metadata::save_json(&meta, &extraction_dir.join("video_metadata.json")) {
        logger::warn(&format!("Failed to save video metadata: {}", e));
    }

    progress(1.0, "Video extraction completed");
    let result = ExtractionResult::completed(extraction_dir, frame_count);
    guard.finish(&result);
    result
}

fn release_all(writers: &mut [&mut Option<(videoio::VideoWriter, String)>]) {
    for slot in writers.iter_mut() {
        if let Some((writer, _)) = slot.as_mut() {
            let _ = writer.release();
        }
    }
}
