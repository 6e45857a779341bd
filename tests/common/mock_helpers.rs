//! Hand-written collaborator fakes for integration tests

use facelive_rs::backend::StageError;
use facelive_rs::stages::synthetic::{PreviewHandle, StaticModelLoader};
use facelive_rs::stages::{CapturedFrame, Collaborators, FaceDetector, FrameCapture};
use facelive_rs::types::{FaceRect, FrameSize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const SCRIPTED_SIZE: FrameSize = FrameSize::new(32, 24, 3);

/// Capture that yields a fixed number of frames, then nothing.
pub struct ScriptedCapture {
    remaining: u64,
    next: u64,
    captures: Arc<AtomicUsize>,
}

impl ScriptedCapture {
    pub fn new(frames: u64, captures: Arc<AtomicUsize>) -> Self {
        Self {
            remaining: frames,
            next: 0,
            captures,
        }
    }
}

impl FrameCapture for ScriptedCapture {
    fn devices(&self) -> Vec<String> {
        vec!["scripted".into()]
    }

    fn open(&mut self, _device: usize) -> Result<(), StageError> {
        Ok(())
    }

    fn capture(&mut self) -> Result<Option<CapturedFrame>, StageError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.captures.fetch_add(1, Ordering::SeqCst);
        let frame_num = self.next;
        self.next += 1;
        Ok(Some(CapturedFrame {
            image: vec![(frame_num * 10) as u8; SCRIPTED_SIZE.byte_len()].into(),
            size: SCRIPTED_SIZE,
            frame_num,
            timestamp: frame_num as f64 / 30.0,
        }))
    }

    fn close(&mut self) {}
}

/// Detector reporting one centred face and counting its calls.
pub struct CountingDetector {
    calls: Arc<AtomicUsize>,
}

impl FaceDetector for CountingDetector {
    fn detect(
        &mut self,
        _frame: &[u8],
        size: FrameSize,
        threshold: f32,
    ) -> Result<Vec<FaceRect>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if threshold > 0.9 {
            return Ok(Vec::new());
        }
        let (w, h) = (size.width as f32, size.height as f32);
        Ok(vec![FaceRect::new(w / 4.0, h / 4.0, w / 2.0, h / 2.0)])
    }
}

/// Counters shared with the fakes inside a running pipeline
#[derive(Clone, Default)]
pub struct Probes {
    pub captures: Arc<AtomicUsize>,
    pub detections: Arc<AtomicUsize>,
    pub preview: PreviewHandle,
}

impl Probes {
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn detections(&self) -> usize {
        self.detections.load(Ordering::SeqCst)
    }
}

/// Built-in collaborators with a scripted file source and a counting detector.
pub fn scripted_collaborators(frames: u64) -> (Collaborators, Probes) {
    let probes = Probes::default();
    let mut collaborators = Collaborators::synthetic(probes.preview.clone());

    let captures = probes.captures.clone();
    collaborators.file =
        Arc::new(move || Box::new(ScriptedCapture::new(frames, captures.clone())) as Box<dyn FrameCapture>);

    let detections = probes.detections.clone();
    collaborators.detectors = Arc::new(StaticModelLoader::<dyn FaceDetector>::new().with_model(
        "counting",
        move || {
            Box::new(CountingDetector {
                calls: detections.clone(),
            })
        },
    ));
    (collaborators, probes)
}
