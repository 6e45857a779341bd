//! Built-in collaborators for headless runs and tests
//!
//! None of these do real vision work. They produce deterministic bytes so a
//! full pipeline can run without cameras or model files, and so tests can
//! check what each stage did to a frame.

use super::collaborators::*;
use crate::backend::StageError;
use crate::types::{FacePose, FaceRecord, FaceRect, FrameSize, Landmarks};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

pub const TEST_PATTERN_SIZE: FrameSize = FrameSize::new(64, 48, 3);

/// Capture device producing a moving gradient.
///
/// A looping source restarts frame numbers at zero after `loop_after` frames,
/// like a video file played on repeat.
#[derive(Debug)]
pub struct TestPatternCapture {
    devices: Vec<String>,
    size: FrameSize,
    loop_after: Option<u64>,
    opened: Option<usize>,
    next_frame: u64,
    started: Instant,
}

impl TestPatternCapture {
    pub fn camera() -> Self {
        Self::new(vec!["Test pattern camera".into()], TEST_PATTERN_SIZE, None)
    }

    pub fn file(loop_after: u64) -> Self {
        Self::new(vec!["test_pattern.seq".into()], TEST_PATTERN_SIZE, Some(loop_after))
    }

    pub fn new(devices: Vec<String>, size: FrameSize, loop_after: Option<u64>) -> Self {
        Self {
            devices,
            size,
            loop_after,
            opened: None,
            next_frame: 0,
            started: Instant::now(),
        }
    }

    fn render(&self, frame_num: u64) -> Vec<u8> {
        let w = self.size.width as usize;
        let ch = self.size.channels as usize;
        let shift = frame_num as usize;
        (0..self.size.byte_len())
            .map(|i| {
                let px = i / ch;
                let (x, y) = (px % w, px / w);
                ((x + y + shift + i % ch * 40) % 256) as u8
            })
            .collect()
    }
}

impl FrameCapture for TestPatternCapture {
    fn devices(&self) -> Vec<String> {
        self.devices.clone()
    }

    fn open(&mut self, device: usize) -> Result<(), StageError> {
        if device >= self.devices.len() {
            return Err(StageError::Device(format!("no device #{}", device)));
        }
        self.opened = Some(device);
        self.next_frame = 0;
        self.started = Instant::now();
        Ok(())
    }

    fn capture(&mut self) -> Result<Option<CapturedFrame>, StageError> {
        if self.opened.is_none() {
            return Err(StageError::Device("device not open".into()));
        }
        if self.loop_after.is_some_and(|n| self.next_frame >= n) {
            self.next_frame = 0;
        }
        let frame_num = self.next_frame;
        self.next_frame += 1;
        Ok(Some(CapturedFrame {
            image: self.render(frame_num).into(),
            size: self.size,
            frame_num,
            timestamp: self.started.elapsed().as_secs_f64(),
        }))
    }

    fn close(&mut self) {
        self.opened = None;
    }
}

/// Reports one face covering the middle half of the frame.
#[derive(Debug, Default)]
pub struct CenterFaceDetector;

impl CenterFaceDetector {
    /// Confidence of the reported face; thresholds above it find nothing.
    pub const CONFIDENCE: f32 = 0.9;
}

impl FaceDetector for CenterFaceDetector {
    fn detect(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        threshold: f32,
    ) -> Result<Vec<FaceRect>, StageError> {
        if frame.len() != size.byte_len() {
            return Err(StageError::collaborator(format!(
                "frame is {} bytes, expected {}",
                frame.len(),
                size.byte_len()
            )));
        }
        if threshold > Self::CONFIDENCE {
            return Ok(Vec::new());
        }
        let (w, h) = (size.width as f32, size.height as f32);
        Ok(vec![FaceRect::new(w / 4.0, h / 4.0, w / 2.0, h / 2.0)])
    }
}

/// Eyes, nose and mouth corners at fixed proportions of the rectangle.
#[derive(Debug, Default)]
pub struct FivePointMarker;

impl FaceMarker for FivePointMarker {
    fn mark(
        &mut self,
        _frame: &[u8],
        _size: FrameSize,
        rect: &FaceRect,
        coverage: f32,
    ) -> Result<(Landmarks, FacePose), StageError> {
        let r = rect.scaled(coverage);
        let at = |fx: f32, fy: f32| (r.x + r.width * fx, r.y + r.height * fy);
        let points = vec![
            at(0.3, 0.35),
            at(0.7, 0.35),
            at(0.5, 0.55),
            at(0.35, 0.75),
            at(0.65, 0.75),
        ];
        Ok((Landmarks::new(points), FacePose::default()))
    }
}

/// Nearest-neighbour resize of `src` (region `rect` of a frame) into a square.
fn crop_square(
    frame: &[u8],
    size: FrameSize,
    rect: &FaceRect,
    resolution: u32,
) -> Result<Vec<u8>, StageError> {
    if frame.len() != size.byte_len() || size.is_empty() {
        return Err(StageError::collaborator("frame does not match its size"));
    }
    let ch = size.channels as usize;
    let res = resolution as usize;
    let mut out = Vec::with_capacity(res * res * ch);
    for oy in 0..res {
        for ox in 0..res {
            let sx = rect.x + rect.width * (ox as f32 + 0.5) / res as f32;
            let sy = rect.y + rect.height * (oy as f32 + 0.5) / res as f32;
            let sx = (sx.max(0.0) as u32).min(size.width.saturating_sub(1)) as usize;
            let sy = (sy.max(0.0) as u32).min(size.height.saturating_sub(1)) as usize;
            let base = (sy * size.width as usize + sx) * ch;
            out.extend_from_slice(&frame[base..base + ch]);
        }
    }
    Ok(out)
}

/// Crops the face rectangle (scaled by coverage) into a square.
#[derive(Debug, Default)]
pub struct CropAligner;

impl FaceAligner for CropAligner {
    fn align(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        face: &FaceRecord,
        coverage: f32,
        resolution: u32,
        _exclude_moving_parts: bool,
    ) -> Result<AlignedFace, StageError> {
        let rect = face
            .rect
            .ok_or_else(|| StageError::collaborator("face has no rectangle"))?;
        let rect = rect.scaled(coverage);
        let res = resolution as usize;
        Ok(AlignedFace {
            image: crop_square(frame, size, &rect, resolution)?,
            mask: vec![255; res * res],
        })
    }
}

/// Inverts every byte of the aligned face.
#[derive(Debug, Default)]
pub struct InvertingSwapModel;

impl FaceSwapModel for InvertingSwapModel {
    fn swap(&mut self, aligned: &[u8], morph_factor: f32) -> Result<SwappedFace, StageError> {
        let m = morph_factor.clamp(0.0, 1.0);
        let image = aligned
            .iter()
            .map(|&b| {
                let inv = 255 - b;
                (b as f32 + (inv as f32 - b as f32) * m).round() as u8
            })
            .collect();
        Ok(SwappedFace {
            image,
            mask: vec![255; aligned.len()],
        })
    }
}

#[derive(Debug, Default)]
pub struct PassthroughAnimator;

impl FaceAnimatorModel for PassthroughAnimator {
    fn animate(&mut self, aligned: &[u8], _relative_power: f32) -> Result<Vec<u8>, StageError> {
        Ok(aligned.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct PassthroughAdjuster;

impl FrameAdjuster for PassthroughAdjuster {
    fn adjust(
        &mut self,
        face: &[u8],
        _median_blur_per: u32,
        _degrade_bicubic_per: u32,
    ) -> Result<Vec<u8>, StageError> {
        Ok(face.to_vec())
    }
}

/// Pastes each square face back over its rectangle, blended by opacity.
#[derive(Debug, Default)]
pub struct OverlayMerger;

impl FaceMerger for OverlayMerger {
    fn merge(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        faces: &[MergeFace],
        params: &MergeParams,
    ) -> Result<Vec<u8>, StageError> {
        if frame.len() != size.byte_len() {
            return Err(StageError::collaborator("frame does not match its size"));
        }
        let mut out = frame.to_vec();
        let ch = size.channels as usize;
        let opacity = params.opacity.clamp(0.0, 1.0);
        for face in faces {
            let res = ((face.image.len() / ch.max(1)) as f64).sqrt() as usize;
            if res == 0 || res * res * ch != face.image.len() {
                return Err(StageError::collaborator("face image is not square"));
            }
            let rect = FaceRect::new(
                face.rect.x + face.rect.width * params.x_offset,
                face.rect.y + face.rect.height * params.y_offset,
                face.rect.width,
                face.rect.height,
            );
            let Some(rect) = rect.clipped(size) else {
                continue;
            };
            let (x0, y0) = (rect.x as usize, rect.y as usize);
            let (w, h) = (rect.width as usize, rect.height as usize);
            for y in y0..(y0 + h).min(size.height as usize) {
                for x in x0..(x0 + w).min(size.width as usize) {
                    let fx = ((x - x0) * res / w.max(1)).min(res - 1);
                    let fy = ((y - y0) * res / h.max(1)).min(res - 1);
                    let alpha = face
                        .mask
                        .as_ref()
                        .and_then(|m| m.get(fy * res + fx))
                        .map_or(1.0, |&a| a as f32 / 255.0)
                        * opacity;
                    for c in 0..ch {
                        let dst = (y * size.width as usize + x) * ch + c;
                        let src = face.image[(fy * res + fx) * ch + c] as f32;
                        out[dst] = (out[dst] as f32 * (1.0 - alpha) + src * alpha).round() as u8;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Latest frame shown by a [`PreviewSink`], readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct PreviewHandle {
    latest: Arc<Mutex<Option<OutputFrame>>>,
    shown: Arc<AtomicU64>,
}

impl PreviewHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<OutputFrame>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn latest(&self) -> Option<OutputFrame> {
        self.lock().clone()
    }

    pub fn frames_shown(&self) -> u64 {
        self.shown.load(Ordering::SeqCst)
    }
}

/// Display stand-in that keeps the most recent frame.
#[derive(Debug)]
pub struct PreviewSink {
    handle: PreviewHandle,
}

impl PreviewSink {
    pub fn new(handle: PreviewHandle) -> Self {
        Self { handle }
    }
}

impl FrameSink for PreviewSink {
    fn show(&mut self, frame: &OutputFrame) -> Result<(), StageError> {
        *self.handle.lock() = Some(frame.clone());
        self.handle.shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes each frame to `<dir>/<frame_num>.raw`.
#[derive(Debug)]
pub struct FileSequenceSink {
    dir: PathBuf,
}

impl FileSequenceSink {
    pub fn create(dir: &Path) -> Result<Self, StageError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn frame_path(&self, frame_num: u64) -> PathBuf {
        self.dir.join(format!("{:08}.raw", frame_num))
    }
}

impl FrameSink for FileSequenceSink {
    fn show(&mut self, frame: &OutputFrame) -> Result<(), StageError> {
        std::fs::write(self.frame_path(frame.frame_num), &frame.image[..])?;
        Ok(())
    }
}

type Constructor<M> = Box<dyn Fn() -> Box<M> + Send + Sync>;

/// Fixed list of named in-memory models.
pub struct StaticModelLoader<M: ?Sized> {
    models: Vec<(String, Constructor<M>)>,
}

impl<M: ?Sized> StaticModelLoader<M> {
    pub fn new() -> Self {
        Self { models: Vec::new() }
    }

    pub fn with_model(
        mut self,
        name: impl Into<String>,
        make: impl Fn() -> Box<M> + Send + Sync + 'static,
    ) -> Self {
        self.models.push((name.into(), Box::new(make)));
        self
    }
}

impl<M: ?Sized> Default for StaticModelLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ?Sized> ModelLoader<M> for StaticModelLoader<M> {
    fn available(&self) -> Vec<String> {
        self.models.iter().map(|(name, _)| name.clone()).collect()
    }

    fn load(&self, name: &str) -> Result<Box<M>, StageError> {
        self.models
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, make)| make())
            .ok_or_else(|| StageError::ModelLoad {
                model: name.to_string(),
                reason: "not available".into(),
            })
    }
}

impl Collaborators {
    /// Built-in collaborators; the output stage's preview lands in `preview`.
    pub fn synthetic(preview: PreviewHandle) -> Self {
        Self {
            camera: Arc::new(|| Box::new(TestPatternCapture::camera()) as Box<dyn FrameCapture>),
            file: Arc::new(|| Box::new(TestPatternCapture::file(300)) as Box<dyn FrameCapture>),
            detectors: Arc::new(
                StaticModelLoader::<dyn FaceDetector>::new()
                    .with_model("center", || Box::new(CenterFaceDetector)),
            ),
            markers: Arc::new(
                StaticModelLoader::<dyn FaceMarker>::new()
                    .with_model("five_point", || Box::new(FivePointMarker)),
            ),
            aligner: Arc::new(|| Box::new(CropAligner) as Box<dyn FaceAligner>),
            animators: Arc::new(
                StaticModelLoader::<dyn FaceAnimatorModel>::new()
                    .with_model("passthrough", || Box::new(PassthroughAnimator)),
            ),
            swappers: Arc::new(
                StaticModelLoader::<dyn FaceSwapModel>::new()
                    .with_model("invert", || Box::new(InvertingSwapModel)),
            ),
            adjuster: Arc::new(|| Box::new(PassthroughAdjuster) as Box<dyn FrameAdjuster>),
            merger: Arc::new(|| Box::new(OverlayMerger) as Box<dyn FaceMerger>),
            preview: Arc::new(move || Box::new(PreviewSink::new(preview.clone())) as Box<dyn FrameSink>),
            sequence: Arc::new(|dir: &Path| {
                FileSequenceSink::create(dir).map(|s| Box::new(s) as Box<dyn FrameSink>)
            }),
        }
    }
}
