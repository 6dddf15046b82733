use super::engine::{ExtractionEngine, ExtractionResult};
use super::{frame_interval, FrameExtractionConfig, SourceFactory};
use crate::output::metadata::{self, FlightInfo, FrameMetadata};
use crate::output::OutputManager;
use crate::shared::constants;
use crate::source::View;
use crate::utils::{file_utils, logger};
use anyhow::{anyhow, bail, Result};
use opencv::core::Mat;
use opencv::imgcodecs;
use std::path::Path;

pub(crate) fn write_image(path: &Path, image: &Mat) -> Result<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))?;
    if !imgcodecs::imwrite_def(path_str, image)? {
        bail!("imwrite refused {}", path.display());
    }
    Ok(())
}

/// Samples left/right camera frames into the dataset tree at the requested
/// rate, numbering them with the dataset-wide persistent counter.
pub fn run(
    engine: &ExtractionEngine,
    factory: SourceFactory,
    cfg: &FrameExtractionConfig,
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
    let output_dir = match out_mgr
        .validate_base()
        .and_then(|_| out_mgr.yolo_frames_dir(&flight))
    {
        Ok(dir) => dir,
        Err(e) => {
            let result =
                ExtractionResult::failure(format!("Failed to create output directory: {}", e));
            guard.finish(&result);
            return result;
        }
    };
    progress(0.1, "Output directory created");

    let interval = frame_interval(props.fps, cfg.fps);
    let ext = cfg.format.extension();

    let mut svo_position = 0usize;
    let mut extracted = 0usize;
    let mut consecutive_errors = 0usize;
    let mut first_frame_number: Option<u32> = None;
    let mut last_frame_number = 0u32;

    guard.mark_running();
    loop {
        if engine.should_cancel() {
            source.close();
            let result = ExtractionResult::cancelled(Some(output_dir), extracted);
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

        let views = [
            (cfg.camera_mode.wants_left(), View::Left, "left"),
            (cfg.camera_mode.wants_right(), View::Right, "right"),
        ];
        for (wanted, view, suffix) in views {
            if !wanted {
                continue;
            }
            let image = match source.retrieve_image(view) {
                Ok(image) => image,
                Err(e) => {
                    logger::warn(&format!(
                        "Skipping {} view of frame {}: {}",
                        suffix, svo_position, e
                    ));
                    continue;
                }
            };
            let frame_number = out_mgr.next_global_frame_number();
            let path = output_dir.join(format!("frame_{:08}_{}.{}", frame_number, suffix, ext));
            match write_image(&path, &image) {
                Ok(()) => {
                    out_mgr.update_global_frame_counter(frame_number);
                    first_frame_number.get_or_insert(frame_number);
                    last_frame_number = frame_number;
                    extracted += 1;
                }
                Err(e) => logger::warn(&format!("Failed to save {}: {}", path.display(), e)),
            }
        }

        svo_position += 1;

        if extracted % constants::PROGRESS_FRAME_INTERVAL == 0 || svo_position % 100 == 0 {
            let fraction = if props.total_frames > 0 {
                svo_position as f32 / props.total_frames as f32
            } else {
                0.0
            };
            progress(
                0.1 + 0.9 * fraction.min(1.0),
                &format!("Extracting frames: {} extracted", extracted),
            );
        }
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

    let meta = FrameMetadata {
        kind: "frame_extraction",
        extraction_datetime: metadata::current_datetime(),
        flight: FlightInfo::from_recording(&cfg.input),
        width: props.width,
        height: props.height,
        source_fps: props.fps,
        total_source_frames: props.total_frames,
        camera_mode: cfg.camera_mode.label().to_string(),
        image_format: ext.to_string(),
        extraction_rate_fps: cfg.fps,
        frame_skip: interval,
        total_extracted_frames: extracted,
        starting_frame_number: first_frame_number.unwrap_or(0),
        ending_frame_number: last_frame_number,
        output_directory: output_dir.to_string_lossy().to_string(),
    };
    if let Err(e) = metadata::save_json(&meta, &output_dir.join("metadata.json")) {
        logger::warn(&format!("Failed to save frame metadata: {}", e));
    }

    progress(1.0, "Frame extraction completed");
    let result = ExtractionResult::completed(output_dir, extracted);
    guard.finish(&result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{CameraMode, ImageFormat};
    use crate::source::testing::{MockFrame, MockSource};
    use crate::source::FrameSource;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("svo_extract_frames_tests").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cfg(base: &Path) -> FrameExtractionConfig {
        FrameExtractionConfig {
            input: PathBuf::from("/recordings/flight_20250114_133000/rec.svo2"),
            base_output: base.to_path_buf(),
            fps: 5.0,
            camera_mode: CameraMode::Left,
            format: ImageFormat::Png,
            stereo: false,
        }
    }

    fn mock_frames(n: usize) -> Vec<MockFrame> {
        (0..n).map(|_| MockFrame::uniform(5.0, 8 * 4)).collect()
    }

    #[test]
    fn test_samples_every_other_frame() {
        let base = scratch("sampling");
        let engine = ExtractionEngine::new();
        // 10 fps source at 5 fps requested: every 2nd frame, so 5 of 10
        let factory: SourceFactory =
            Box::new(|| Ok(Box::new(MockSource::new(8, 4, mock_frames(10))) as Box<dyn FrameSource>));
        let result = run(&engine, factory, &cfg(&base), &|_, _| {});

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.frames_processed, 5);
        let dir = result.output_path.unwrap();
        assert!(dir.join("frame_00000001_left.png").is_file());
        assert!(dir.join("frame_00000005_left.png").is_file());
        assert!(!dir.join("frame_00000006_left.png").exists());
        assert!(dir.join("metadata.json").is_file());
    }

    #[test]
    fn test_zero_frames_is_failure_with_hint() {
        let base = scratch("zero");
        let engine = ExtractionEngine::new();
        let factory: SourceFactory =
            Box::new(|| Ok(Box::new(MockSource::new(8, 4, Vec::new())) as Box<dyn FrameSource>));
        let result = run(&engine, factory, &cfg(&base), &|_, _| {});

        assert!(!result.success);
        assert!(!result.cancelled);
        assert!(result.error.unwrap().contains("rec.svo2"));
    }

    #[test]
    fn test_second_start_fails_immediately() {
        let base = scratch("busy");
        let engine = ExtractionEngine::new();
        let guard = engine.try_begin().unwrap();

        let factory: SourceFactory =
            Box::new(|| Ok(Box::new(MockSource::new(8, 4, mock_frames(3))) as Box<dyn FrameSource>));
        let result = run(&engine, factory, &cfg(&base), &|_, _| {});
        assert!(!result.success);
        assert!(result.error.unwrap().contains("already in progress"));

        guard.finish(&ExtractionResult::completed(base, 0));
    }

    #[test]
    fn test_consecutive_grab_errors_convert_to_failure() {
        let base = scratch("graberrors");
        let engine = ExtractionEngine::new();
        let factory: SourceFactory = Box::new(|| {
            let mut src = MockSource::new(8, 4, mock_frames(3));
            src.failing_grabs = 60;
            Ok(Box::new(src) as Box<dyn FrameSource>)
        });
        let result = run(&engine, factory, &cfg(&base), &|_, _| {});
        assert!(!result.success);
        assert!(result.error.unwrap().contains("consecutive grab errors"));
    }
}
