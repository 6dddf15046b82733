use super::{FrameSource, Measure, SourceProperties, View};
use crate::depth::{codec, RawDepthFormat};
use crate::shared::constants;
use crate::utils::file_utils;
use anyhow::{anyhow, bail, Result};
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::path::{Path, PathBuf};

/// Re-ingests a previous depth extraction directory as a frame source:
/// raw depth through the depth codec, RGB and confidence from the PNG
/// side-channels when present. This is what offline re-processing of an
/// exported dataset runs against.
pub struct DatasetSource {
    root: PathBuf,
    frames: Vec<DatasetFrame>,
    format: RawDepthFormat,
    props: SourceProperties,
    cursor: usize,
    grabbed: i32,
}

struct DatasetFrame {
    depth_path: PathBuf,
    index: u32,
}

const FORMAT_PROBE_ORDER: &[RawDepthFormat] = &[
    RawDepthFormat::Tiff,
    RawDepthFormat::Pfm,
    RawDepthFormat::Exr,
    RawDepthFormat::Bin,
];

impl DatasetSource {
    pub fn open(root: &Path) -> Result<Self> {
        let depth_dir = root.join(constants::DEPTH_MAPS_DIR);
        if !depth_dir.is_dir() {
            bail!(
                "{} has no {} directory; not an extraction dataset",
                root.display(),
                constants::DEPTH_MAPS_DIR
            );
        }

        let mut frames = Vec::new();
        let mut format = None;
        for fmt in FORMAT_PROBE_ORDER {
            let files = file_utils::list_files(&depth_dir, fmt.extension())?;
            if files.is_empty() {
                continue;
            }
            for path in files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let Some(index) = file_utils::frame_index_from_name(&name, "depth_") else {
                    continue;
                };
                frames.push(DatasetFrame {
                    depth_path: path,
                    index,
                });
            }
            format = Some(*fmt);
            break;
        }
        frames.sort_by_key(|f| f.index);
        let format =
            format.ok_or_else(|| anyhow!("No depth frames found in {}", depth_dir.display()))?;
        if frames.is_empty() {
            bail!("No depth frames found in {}", depth_dir.display());
        }

        // Frame geometry and rate come from the metadata record when
        // present, otherwise from decoding the first frame
        let (mut width, mut height, mut fps) = (0i32, 0i32, 1.0f64);
        let meta_path = root.join(constants::DEPTH_METADATA_FILE);
        if let Ok(raw) = std::fs::read_to_string(&meta_path) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                width = value["width"].as_i64().unwrap_or(0) as i32;
                height = value["height"].as_i64().unwrap_or(0) as i32;
                fps = value["output_fps"].as_f64().unwrap_or(1.0);
            }
        }
        if width <= 0 || height <= 0 {
            if format == RawDepthFormat::Bin {
                bail!(
                    "Binary depth dumps need dimensions from {}, which is missing or incomplete",
                    meta_path.display()
                );
            }
            let first = codec::read(&frames[0].depth_path, format, None)?;
            width = first.cols();
            height = first.rows();
        }

        Ok(Self {
            props: SourceProperties::new(width, height, fps, frames.len() as i32),
            root: root.to_path_buf(),
            frames,
            format,
            cursor: 0,
            grabbed: -1,
        })
    }

    fn current(&self) -> Result<&DatasetFrame> {
        if self.grabbed < 0 {
            bail!("No frame grabbed from {}", self.root.display());
        }
        self.frames
            .get(self.grabbed as usize)
            .ok_or_else(|| anyhow!("Dataset cursor out of range"))
    }

    fn side_file(&self, dir: &str, prefix: &str) -> Result<PathBuf> {
        let frame = self.current()?;
        Ok(self
            .root
            .join(dir)
            .join(format!("{}{:06}.png", prefix, frame.index)))
    }
}

impl FrameSource for DatasetSource {
    fn properties(&self) -> SourceProperties {
        self.props.clone()
    }

    fn provides_measures(&self) -> bool {
        true
    }

    fn grab(&mut self) -> Result<bool> {
        if self.cursor >= self.frames.len() {
            return Ok(false);
        }
        self.grabbed = self.cursor as i32;
        self.cursor += 1;
        Ok(true)
    }

    fn retrieve_image(&mut self, view: View) -> Result<Mat> {
        if view != View::Left {
            bail!("Extraction datasets retain only the left view");
        }
        let path = self.side_file(constants::LEFT_RGB_DIR, "left_")?;
        if !path.is_file() {
            bail!("No RGB frame at {}", path.display());
        }
        let mat = imgcodecs::imread(
            path.to_str()
                .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))?,
            imgcodecs::IMREAD_COLOR,
        )?;
        if mat.empty() {
            bail!("Could not decode {}", path.display());
        }
        Ok(mat)
    }

    fn retrieve_measure(&mut self, measure: Measure) -> Result<Mat> {
        match measure {
            Measure::Depth => {
                let path = self.current()?.depth_path.clone();
                codec::read(
                    &path,
                    self.format,
                    Some((self.props.height, self.props.width)),
                )
            }
            Measure::Confidence => {
                let path = self.side_file(constants::CONFIDENCE_MAPS_DIR, "conf_")?;
                if !path.is_file() {
                    bail!("No confidence map at {}", path.display());
                }
                let mat = imgcodecs::imread(
                    path.to_str()
                        .ok_or_else(|| anyhow!("Non-UTF8 path: {}", path.display()))?,
                    imgcodecs::IMREAD_GRAYSCALE,
                )?;
                if mat.empty() {
                    bail!("Could not decode {}", path.display());
                }
                Ok(mat)
            }
        }
    }

    fn seek(&mut self, frame_index: i32) -> Result<()> {
        if frame_index < 0 || frame_index as usize > self.frames.len() {
            bail!("Frame index out of range: {}", frame_index);
        }
        self.cursor = frame_index as usize;
        Ok(())
    }

    fn current_position(&self) -> i32 {
        self.grabbed
    }
}
