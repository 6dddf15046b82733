use super::colorize::LegendInfo;
use super::RawDepthFormat;
use anyhow::{anyhow, Result};
use fast_image_resize as fr;
use fr::images::Image;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// One retained preview: dense zero-based store index, the downscaled
/// heatmap (absent when preview retention is off), and the source frame it
/// was computed from.
pub struct StoredPreview {
    pub index: usize,
    pub image: Option<Mat>,
    pub source_frame: i32,
}

/// What the re-processor needs to find a historical frame again.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub extraction_dir: PathBuf,
    pub source_path: PathBuf,
    pub raw_format: RawDepthFormat,
    pub stereo: bool,
    pub width: i32,
    pub height: i32,
    pub preview_max_width: i32,
}

struct PreviewBundle {
    image: Option<Mat>,
    legend: Option<Mat>,
    info: Option<LegendInfo>,
    version: u64,
}

/// Shared state between the extraction worker and its observers: the
/// append-only preview sequence of the current run, the live preview
/// bundle, and the run context for re-processing. Readers always receive
/// deep copies, never aliases into worker-owned buffers.
///
/// There is no eviction; previews live until the next run clears them.
pub struct FrameStore {
    entries: Mutex<Vec<StoredPreview>>,
    preview: Mutex<PreviewBundle>,
    run: Mutex<Option<RunContext>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            preview: Mutex::new(PreviewBundle {
                image: None,
                legend: None,
                info: None,
                version: 0,
            }),
            run: Mutex::new(None),
        }
    }

    /// Clears the previous run's previews and installs the new context.
    pub fn begin_run(&self, ctx: RunContext) {
        lock(&self.entries).clear();
        let mut preview = lock(&self.preview);
        preview.image = None;
        preview.legend = None;
        preview.info = None;
        *lock(&self.run) = Some(ctx);
    }

    pub fn run_context(&self) -> Option<RunContext> {
        lock(&self.run).clone()
    }

    /// Appends a preview and returns its dense store index.
    pub fn push_preview(&self, image: Option<Mat>, source_frame: i32) -> usize {
        let mut entries = lock(&self.entries);
        let index = entries.len();
        entries.push(StoredPreview {
            index,
            image,
            source_frame,
        });
        index
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep copy of one entry.
    pub fn entry(&self, index: usize) -> Option<StoredPreview> {
        let entries = lock(&self.entries);
        let e = entries.get(index)?;
        Some(StoredPreview {
            index: e.index,
            image: e.image.as_ref().and_then(|m| m.try_clone().ok()),
            source_frame: e.source_frame,
        })
    }

    /// Replaces one entry's preview image after re-processing.
    pub fn update_entry(&self, index: usize, image: Mat) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get_mut(index) {
            Some(e) => {
                e.image = Some(image);
                true
            }
            None => false,
        }
    }

    /// Publishes the latest heatmap for progress-time display; bumps the
    /// version so pollers can cheaply detect changes.
    pub fn set_live_preview(&self, image: &Mat, info: LegendInfo) -> Result<()> {
        let copy = image.try_clone()?;
        let mut preview = lock(&self.preview);
        preview.image = Some(copy);
        preview.info = Some(info);
        preview.version += 1;
        Ok(())
    }

    pub fn set_legend(&self, legend: &Mat) -> Result<()> {
        let copy = legend.try_clone()?;
        let mut preview = lock(&self.preview);
        preview.legend = Some(copy);
        preview.version += 1;
        Ok(())
    }

    /// Deep copy of the live preview plus its version counter.
    pub fn live_preview(&self) -> Option<(Mat, u64)> {
        let preview = lock(&self.preview);
        let image = preview.image.as_ref()?.try_clone().ok()?;
        Some((image, preview.version))
    }

    pub fn preview_version(&self) -> u64 {
        lock(&self.preview).version
    }

    pub fn legend(&self) -> Option<(Mat, LegendInfo)> {
        let preview = lock(&self.preview);
        let legend = preview.legend.as_ref()?.try_clone().ok()?;
        let info = preview.info.clone()?;
        Some((legend, info))
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Downscales a BGR heatmap to at most `max_width` columns for retention,
/// keeping aspect ratio. SIMD resize; frames at or under the limit are
/// copied as-is.
pub fn downscale_preview(image: &Mat, max_width: i32) -> Result<Mat> {
    if image.empty() || image.typ() != core::CV_8UC3 {
        return Err(anyhow!("Preview downscale expects a CV_8UC3 image"));
    }
    if image.cols() <= max_width || max_width <= 0 {
        return Ok(image.try_clone()?);
    }

    let owned;
    let image = if image.is_continuous() {
        image
    } else {
        owned = image.try_clone()?;
        &owned
    };

    let src_w = image.cols() as u32;
    let src_h = image.rows() as u32;
    let dst_w = max_width as u32;
    let dst_h = ((src_h as f64 * dst_w as f64 / src_w as f64).round() as u32).max(1);

    let src = Image::from_vec_u8(
        src_w,
        src_h,
        image.data_bytes()?.to_vec(),
        fr::PixelType::U8x3,
    )?;
    let mut dst = Image::new(dst_w, dst_h, fr::PixelType::U8x3);
    let mut resizer = fr::Resizer::new();
    resizer.resize(&src, &mut dst, None)?;

    let mut out = Mat::new_rows_cols_with_default(
        dst_h as i32,
        dst_w as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    out.data_bytes_mut()?.copy_from_slice(dst.buffer());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::{EffectiveRange, VisualizationConfig};

    fn bgr(rows: i32, cols: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(
            rows,
            cols,
            core::CV_8UC3,
            Scalar::new(value, value, value, 0.0),
        )
        .unwrap()
    }

    fn info() -> LegendInfo {
        LegendInfo::new(
            EffectiveRange::normalized(1.0, 10.0),
            &VisualizationConfig::default(),
        )
    }

    #[test]
    fn test_indices_are_dense_and_ordered() {
        let store = FrameStore::new();
        store.begin_run(RunContext {
            extraction_dir: "/tmp/x".into(),
            source_path: "/tmp/y.svo2".into(),
            raw_format: RawDepthFormat::Tiff,
            stereo: false,
            width: 8,
            height: 4,
            preview_max_width: 640,
        });
        assert_eq!(store.push_preview(Some(bgr(4, 8, 10.0)), 0), 0);
        assert_eq!(store.push_preview(None, 5), 1);
        assert_eq!(store.push_preview(Some(bgr(4, 8, 30.0)), 10), 2);
        assert_eq!(store.len(), 3);

        let e = store.entry(1).unwrap();
        assert_eq!(e.index, 1);
        assert_eq!(e.source_frame, 5);
        assert!(e.image.is_none());
        assert!(store.entry(3).is_none());
    }

    #[test]
    fn test_begin_run_clears_previous_entries() {
        let store = FrameStore::new();
        let ctx = RunContext {
            extraction_dir: "/tmp/a".into(),
            source_path: "/tmp/b.svo2".into(),
            raw_format: RawDepthFormat::Pfm,
            stereo: true,
            width: 8,
            height: 4,
            preview_max_width: 640,
        };
        store.begin_run(ctx.clone());
        store.push_preview(None, 0);
        store.push_preview(None, 1);
        store.begin_run(ctx);
        assert!(store.is_empty());
        assert!(store.live_preview().is_none());
    }

    #[test]
    fn test_entry_returns_defensive_copy() {
        let store = FrameStore::new();
        store.push_preview(Some(bgr(2, 2, 50.0)), 0);

        let mut copy = store.entry(0).unwrap().image.unwrap();
        copy.set_to(&Scalar::all(0.0), &core::no_array()).unwrap();

        let fresh = store.entry(0).unwrap().image.unwrap();
        assert_eq!(*fresh.at_2d::<core::Vec3b>(0, 0).unwrap(), core::Vec3b::from([50, 50, 50]));
    }

    #[test]
    fn test_live_preview_versioning() {
        let store = FrameStore::new();
        assert_eq!(store.preview_version(), 0);
        store.set_live_preview(&bgr(2, 2, 10.0), info()).unwrap();
        store.set_live_preview(&bgr(2, 2, 20.0), info()).unwrap();
        let (image, version) = store.live_preview().unwrap();
        assert_eq!(version, 2);
        assert_eq!(*image.at_2d::<core::Vec3b>(0, 0).unwrap(), core::Vec3b::from([20, 20, 20]));
    }

    #[test]
    fn test_update_entry_bounds() {
        let store = FrameStore::new();
        store.push_preview(Some(bgr(2, 2, 10.0)), 0);
        assert!(store.update_entry(0, bgr(2, 2, 99.0)));
        assert!(!store.update_entry(7, bgr(2, 2, 99.0)));
        let e = store.entry(0).unwrap().image.unwrap();
        assert_eq!(*e.at_2d::<core::Vec3b>(0, 0).unwrap(), core::Vec3b::from([99, 99, 99]));
    }

    #[test]
    fn test_downscale_keeps_aspect() {
        let img = bgr(100, 200, 80.0);
        let small = downscale_preview(&img, 50).unwrap();
        assert_eq!(small.cols(), 50);
        assert_eq!(small.rows(), 25);

        let untouched = downscale_preview(&img, 400).unwrap();
        assert_eq!(untouched.cols(), 200);
        assert_eq!(untouched.rows(), 100);
    }
}
