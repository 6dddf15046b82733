pub mod metadata;

use crate::shared::constants;
use crate::utils::{file_utils, logger};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct FrameCounter {
    last_frame: u32,
    updated: String,
}

/// Allocates the on-disk output tree:
/// `Extractions/<flight>/extraction_NNN` for video and depth runs,
/// `Yolo_Training/Unfiltered_Images/<flight>` for sampled dataset frames,
/// and the dataset-wide frame counter persisted across runs.
pub struct OutputManager {
    base: PathBuf,
    extractions: PathBuf,
    yolo_images: PathBuf,
    counter_file: PathBuf,
}

impl OutputManager {
    pub fn new(base: &Path) -> Self {
        let yolo = base.join(constants::YOLO_TRAINING_DIR);
        Self {
            extractions: base.join(constants::EXTRACTIONS_DIR),
            yolo_images: yolo.join(constants::UNFILTERED_IMAGES_DIR),
            counter_file: yolo.join(constants::FRAME_COUNTER_FILE),
            base: base.to_path_buf(),
        }
    }

    /// Creates the base directory when absent and verifies it is writable
    /// before any frame processing starts.
    pub fn validate_base(&self) -> Result<()> {
        fs::create_dir_all(&self.base)
            .with_context(|| format!("Failed to create output directory {}", self.base.display()))?;
        let probe = self.base.join(".write_test");
        fs::write(&probe, b"ok")
            .with_context(|| format!("Output directory {} is not writable", self.base.display()))?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    pub fn ensure_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))
    }

    fn next_extraction_number(&self, flight: &str) -> u32 {
        let flight_path = self.extractions.join(flight);
        let mut max_number = 0;
        if let Ok(entries) = fs::read_dir(&flight_path) {
            for entry in entries.filter_map(|e| e.ok()) {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(digits) = name.strip_prefix("extraction_") {
                    if digits.len() == 3 {
                        if let Ok(n) = digits.parse::<u32>() {
                            max_number = max_number.max(n);
                        }
                    }
                }
            }
        }
        max_number + 1
    }

    /// Fresh numbered extraction directory for one video/depth run.
    pub fn create_extraction_dir(&self, flight: &str) -> Result<PathBuf> {
        let number = self.next_extraction_number(flight);
        let path = self
            .extractions
            .join(flight)
            .join(format!("extraction_{:03}", number));
        Self::ensure_dir(&path)?;
        logger::info(&format!("Created extraction path: {}", path.display()));
        Ok(path)
    }

    /// Dataset frame directory for one flight.
    pub fn yolo_frames_dir(&self, flight: &str) -> Result<PathBuf> {
        let path = self.yolo_images.join(flight);
        Self::ensure_dir(&path)?;
        Ok(path)
    }

    fn scan_highest_frame_number(dir: &Path) -> u32 {
        let mut max_number = 0;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(n) = file_utils::frame_index_from_name(&name, "frame_") {
                    max_number = max_number.max(n);
                }
            }
        }
        max_number
    }

    /// Next value of the dataset-wide monotonically increasing frame
    /// number. Reconciles the counter file against a scan of the frame
    /// folders, so a deleted or stale counter never reissues numbers.
    pub fn next_global_frame_number(&self) -> u32 {
        let mut max_number = 0;
        if let Ok(entries) = fs::read_dir(&self.yolo_images) {
            for entry in entries.filter_map(|e| e.ok()) {
                if entry.path().is_dir() {
                    max_number = max_number.max(Self::scan_highest_frame_number(&entry.path()));
                }
            }
        }
        if let Ok(raw) = fs::read_to_string(&self.counter_file) {
            if let Ok(counter) = serde_json::from_str::<FrameCounter>(&raw) {
                max_number = max_number.max(counter.last_frame);
            }
        }
        max_number + 1
    }

    pub fn update_global_frame_counter(&self, last_frame: u32) {
        let counter = FrameCounter {
            last_frame,
            updated: metadata::current_datetime(),
        };
        let write = || -> Result<()> {
            if let Some(parent) = self.counter_file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.counter_file, serde_json::to_string_pretty(&counter)?)?;
            Ok(())
        };
        if let Err(e) = write() {
            logger::warn(&format!("Failed to update frame counter: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("svo_extract_output_tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_extraction_numbers_increase() {
        let base = scratch("numbers");
        let mgr = OutputManager::new(&base);
        mgr.validate_base().unwrap();
        let first = mgr.create_extraction_dir("flight_20250114_133000").unwrap();
        let second = mgr.create_extraction_dir("flight_20250114_133000").unwrap();
        assert!(first.ends_with("extraction_001"));
        assert!(second.ends_with("extraction_002"));
        // Another flight numbers independently
        let other = mgr.create_extraction_dir("flight_20250115_090000").unwrap();
        assert!(other.ends_with("extraction_001"));
    }

    #[test]
    fn test_global_counter_survives_runs() {
        let base = scratch("counter");
        let mgr = OutputManager::new(&base);
        mgr.validate_base().unwrap();
        assert_eq!(mgr.next_global_frame_number(), 1);
        mgr.update_global_frame_counter(41);

        // A second manager over the same tree continues the sequence
        let mgr2 = OutputManager::new(&base);
        assert_eq!(mgr2.next_global_frame_number(), 42);
    }

    #[test]
    fn test_counter_reconciles_with_frames_on_disk() {
        let base = scratch("reconcile");
        let mgr = OutputManager::new(&base);
        mgr.validate_base().unwrap();
        let frames = mgr.yolo_frames_dir("flight_20250114_133000").unwrap();
        fs::write(frames.join("frame_00000117_left.png"), b"x").unwrap();
        // Counter file says less than what is on disk; the scan wins
        mgr.update_global_frame_counter(10);
        assert_eq!(mgr.next_global_frame_number(), 118);
    }
}
