//! Opaque processing collaborators
//!
//! Stages never do pixel or tensor math themselves. Each one calls a
//! synchronous collaborator through one of these traits; failures come back
//! as [`StageError`] and stay local to the stage.
//!
//! Images are raw interleaved 8-bit buffers described by a [`FrameSize`].

use crate::backend::StageError;
use crate::types::{FacePose, FaceRect, FaceRecord, FrameSize, Landmarks};
use std::path::Path;
use std::sync::Arc;

/// One frame delivered by a capture device.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: Arc<[u8]>,
    pub size: FrameSize,
    pub frame_num: u64,
    pub timestamp: f64,
}

/// Camera or file reader.
#[cfg_attr(test, mockall::automock)]
pub trait FrameCapture: Send {
    fn devices(&self) -> Vec<String>;
    fn open(&mut self, device: usize) -> Result<(), StageError>;
    /// `Ok(None)` when no frame is ready yet.
    fn capture(&mut self) -> Result<Option<CapturedFrame>, StageError>;
    fn close(&mut self);
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceDetector: Send {
    fn detect(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        threshold: f32,
    ) -> Result<Vec<FaceRect>, StageError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceMarker: Send {
    fn mark(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        rect: &FaceRect,
        coverage: f32,
    ) -> Result<(Landmarks, FacePose), StageError>;
}

/// Square face crop plus its mask, both `resolution x resolution`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFace {
    pub image: Vec<u8>,
    pub mask: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceAligner: Send {
    fn align(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        face: &FaceRecord,
        coverage: f32,
        resolution: u32,
        exclude_moving_parts: bool,
    ) -> Result<AlignedFace, StageError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceAnimatorModel: Send {
    fn animate(&mut self, aligned: &[u8], relative_power: f32) -> Result<Vec<u8>, StageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwappedFace {
    pub image: Vec<u8>,
    pub mask: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceSwapModel: Send {
    fn swap(&mut self, aligned: &[u8], morph_factor: f32) -> Result<SwappedFace, StageError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait FrameAdjuster: Send {
    /// Percentages are 0..=100.
    fn adjust(
        &mut self,
        face: &[u8],
        median_blur_per: u32,
        degrade_bicubic_per: u32,
    ) -> Result<Vec<u8>, StageError>;
}

/// One face to paste back into the frame.
#[derive(Debug, Clone)]
pub struct MergeFace {
    pub rect: FaceRect,
    pub image: Arc<[u8]>,
    pub mask: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceMaskType {
    Source,
    Swapped,
    SourceTimesSwapped,
}

impl FaceMaskType {
    pub const NAMES: [&'static str; 3] = ["source", "swapped", "source*swapped"];

    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => FaceMaskType::Source,
            1 => FaceMaskType::Swapped,
            _ => FaceMaskType::SourceTimesSwapped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    pub x_offset: f32,
    pub y_offset: f32,
    pub mask_type: FaceMaskType,
    pub opacity: f32,
}

#[cfg_attr(test, mockall::automock)]
pub trait FaceMerger: Send {
    fn merge(
        &mut self,
        frame: &[u8],
        size: FrameSize,
        faces: &[MergeFace],
        params: &MergeParams,
    ) -> Result<Vec<u8>, StageError>;
}

/// A frame handed to an output sink.
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub uid: u64,
    pub frame_num: u64,
    pub timestamp: f64,
    pub size: Option<FrameSize>,
    pub image: Arc<[u8]>,
}

/// Display window, file writer or network streamer.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send {
    fn show(&mut self, frame: &OutputFrame) -> Result<(), StageError>;
}

/// Lists and loads named models. Loading is the heavy one-time operation
/// during which a stage reports busy.
pub trait ModelLoader<M: ?Sized>: Send + Sync {
    fn available(&self) -> Vec<String>;
    fn load(&self, name: &str) -> Result<Box<M>, StageError>;
}

/// Constructs a fresh collaborator per stage instance.
pub type Provider<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// Opens a file-sequence sink in a directory.
pub type SequenceOpener = Arc<dyn Fn(&Path) -> Result<Box<dyn FrameSink>, StageError> + Send + Sync>;

/// Everything the default factory needs to build stages.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: Provider<dyn FrameCapture>,
    pub file: Provider<dyn FrameCapture>,
    pub detectors: Arc<dyn ModelLoader<dyn FaceDetector>>,
    pub markers: Arc<dyn ModelLoader<dyn FaceMarker>>,
    pub aligner: Provider<dyn FaceAligner>,
    pub animators: Arc<dyn ModelLoader<dyn FaceAnimatorModel>>,
    pub swappers: Arc<dyn ModelLoader<dyn FaceSwapModel>>,
    pub adjuster: Provider<dyn FrameAdjuster>,
    pub merger: Provider<dyn FaceMerger>,
    pub preview: Provider<dyn FrameSink>,
    pub sequence: SequenceOpener,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("detectors", &self.detectors.available())
            .field("markers", &self.markers.available())
            .field("animators", &self.animators.available())
            .field("swappers", &self.swappers.available())
            .finish_non_exhaustive()
    }
}
