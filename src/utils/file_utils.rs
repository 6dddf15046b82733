use crate::shared::constants;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case(extension))
        })
        .collect();

    // Sort alphabetically (works for padded numbers like depth_000001.tiff)
    files.sort();

    Ok(files)
}

/// Information about one SVO2 recording found on disk.
#[derive(Debug, Clone)]
pub struct SvoFileInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub parent_folder: String,
    pub size_bytes: u64,
    pub is_flight_folder: bool,
}

impl SvoFileInfo {
    pub fn formatted_size(&self) -> String {
        formatted_size(self.size_bytes)
    }
}

pub fn formatted_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

fn has_svo_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            constants::SVO_EXTENSIONS
                .iter()
                .any(|s| e.eq_ignore_ascii_case(s))
        })
        .unwrap_or(false)
}

/// A file is accepted as an SVO2 recording when it exists, carries an
/// .svo/.svo2 extension (case-insensitive) and is not empty.
pub fn validate_svo_file(path: &Path) -> bool {
    if !path.is_file() || !has_svo_extension(path) {
        return false;
    }
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Recursively scans a directory tree for SVO2 recordings.
pub fn scan_for_svo_files(dir: &Path, recursive: bool) -> Result<Vec<SvoFileInfo>> {
    let mut found = Vec::new();
    scan_dir(dir, recursive, &mut found)?;
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

fn scan_dir(dir: &Path, recursive: bool, found: &mut Vec<SvoFileInfo>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to scan directory: {}", dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                // Unreadable subdirectories are skipped, not fatal
                let _ = scan_dir(&path, recursive, found);
            }
            continue;
        }
        if !has_svo_extension(&path) {
            continue;
        }
        let parent_folder = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        found.push(SvoFileInfo {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            size_bytes: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            is_flight_folder: is_flight_folder(&parent_folder),
            parent_folder,
            path,
        });
    }
    Ok(())
}

/// Checks the `flight_YYYYMMDD_HHMMSS` folder naming convention.
pub fn is_flight_folder(name: &str) -> bool {
    let rest = match name.strip_prefix("flight_") {
        Some(r) => r,
        None => return false,
    };
    let mut parts = rest.splitn(2, '_');
    let date = parts.next().unwrap_or("");
    let time = parts.next().unwrap_or("");
    date.len() == 8
        && time.len() == 6
        && date.chars().all(|c| c.is_ascii_digit())
        && time.chars().all(|c| c.is_ascii_digit())
}

/// Derives the flight folder name for a recording path: the parent folder
/// name when it follows the flight convention, a placeholder otherwise.
pub fn flight_folder_for(svo_path: &Path) -> String {
    svo_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| is_flight_folder(n))
        .unwrap_or_else(|| constants::UNKNOWN_FLIGHT.to_string())
}

/// Parses the numeric index out of a frame file name such as
/// `depth_000042.tiff` or `frame_00000042_left.png`, given its prefix.
pub fn frame_index_from_name(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flight_folder_pattern() {
        assert!(is_flight_folder("flight_20250114_133000"));
        assert!(!is_flight_folder("flight_2025114_133000"));
        assert!(!is_flight_folder("flight_20250114_1330"));
        assert!(!is_flight_folder("flight_20250114133000"));
        assert!(!is_flight_folder("mission_20250114_133000"));
        assert!(!is_flight_folder("flight_2025011a_133000"));
    }

    #[test]
    fn test_frame_index_parsing() {
        assert_eq!(frame_index_from_name("depth_000042.tiff", "depth_"), Some(42));
        assert_eq!(
            frame_index_from_name("frame_00000007_left.png", "frame_"),
            Some(7)
        );
        assert_eq!(frame_index_from_name("depth_.tiff", "depth_"), None);
        assert_eq!(frame_index_from_name("conf_12.png", "depth_"), None);
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512), "512 B");
        assert_eq!(formatted_size(2048), "2.0 KB");
        assert_eq!(formatted_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(formatted_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_validate_svo_rejects_wrong_extension() {
        let dir = std::env::temp_dir().join("svo_extract_validate_test");
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("rec.svo2");
        let bad = dir.join("rec.mp4");
        std::fs::write(&good, b"data").unwrap();
        std::fs::write(&bad, b"data").unwrap();
        let empty = dir.join("empty.svo");
        std::fs::write(&empty, b"").unwrap();

        assert!(validate_svo_file(&good));
        assert!(!validate_svo_file(&bad));
        assert!(!validate_svo_file(&empty));
        assert!(!validate_svo_file(&dir.join("missing.svo2")));
    }
}
