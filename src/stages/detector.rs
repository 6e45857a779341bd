//! Face detector stage.

use super::collaborators::{FaceDetector, ModelLoader};
use super::{
    accept_choice, accept_number, publish_number, publish_selection, FrameLoopTracker, ModelSlot,
    LOAD_PROGRESS_FIELD,
};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, FieldValue, NumberConfig, SelectionConfig, SheetBuilder};
use crate::types::{FaceRecord, FaceRect, FRAME_KEY};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MAX_FACES: f64 = 1.0;
pub const DEFAULT_TEMPORAL_SMOOTHING: f64 = 1.0;

/// Order of detected faces, which is also their face id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortBy {
    #[default]
    Largest,
    DistFromCenter,
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
}

impl SortBy {
    pub fn all() -> &'static [SortBy] {
        &[
            SortBy::Largest,
            SortBy::DistFromCenter,
            SortBy::LeftRight,
            SortBy::RightLeft,
            SortBy::TopBottom,
            SortBy::BottomTop,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SortBy::Largest => "Largest",
            SortBy::DistFromCenter => "Dist from center",
            SortBy::LeftRight => "Left to right",
            SortBy::RightLeft => "Right to left",
            SortBy::TopBottom => "Top to bottom",
            SortBy::BottomTop => "Bottom to top",
        }
    }

    pub fn sort(&self, rects: &mut [FaceRect], frame_center: (f32, f32)) {
        let key = |r: &FaceRect| -> f32 {
            match self {
                SortBy::Largest => -r.area(),
                SortBy::DistFromCenter => r.distance_to(frame_center),
                SortBy::LeftRight => r.x,
                SortBy::RightLeft => -r.x,
                SortBy::TopBottom => r.y,
                SortBy::BottomTop => -r.y,
            }
        };
        rects.sort_by(|a, b| key(a).total_cmp(&key(b)));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorState {
    /// Defaults to the first available model.
    pub model: Option<String>,
    pub threshold: Option<f64>,
    /// 0 keeps every face.
    pub max_faces: Option<f64>,
    pub sort_by: Option<SortBy>,
    /// Number of frames each face rectangle is averaged over. 1 disables.
    pub temporal_smoothing: Option<f64>,
}

pub struct DetectorWorker {
    slot: ModelSlot<dyn FaceDetector>,
    frames: FrameLoopTracker,
    /// Recent rectangles per face id, oldest first.
    history: Vec<VecDeque<FaceRect>>,
}

impl DetectorWorker {
    pub fn new(loader: Arc<dyn ModelLoader<dyn FaceDetector>>) -> Self {
        Self {
            slot: ModelSlot::new(loader),
            frames: FrameLoopTracker::default(),
            history: Vec::new(),
        }
    }

    /// Average each face over its last `window` rectangles.
    fn smooth(&mut self, rects: Vec<FaceRect>, window: usize) -> Vec<FaceRect> {
        if window <= 1 {
            self.history.clear();
            return rects;
        }
        self.history.resize_with(rects.len(), VecDeque::new);
        rects
            .into_iter()
            .zip(self.history.iter_mut())
            .map(|(rect, past)| {
                past.push_back(rect);
                while past.len() > window {
                    past.pop_front();
                }
                let n = past.len() as f32;
                let (x, y, w, h) = past.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, r| {
                    (acc.0 + r.x, acc.1 + r.y, acc.2 + r.width, acc.3 + r.height)
                });
                FaceRect::new(x / n, y / n, w / n, h / n)
            })
            .collect()
    }
}

impl StageWorker for DetectorWorker {
    type State = DetectorState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection("model", SelectionConfig::default())
            .number("threshold", NumberConfig::new(0.01, 1.0, 0.01, 2))
            .number("max_faces", NumberConfig::int(0, 16))
            .number("temporal_smoothing", NumberConfig::int(1, 50))
            .selection(
                "sort_by",
                SelectionConfig::new(SortBy::all().iter().map(SortBy::display_name)),
            )
            .progress(LOAD_PROGRESS_FIELD);
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<DetectorState>) -> Result<(), StageError> {
        let models = self.slot.available();
        let wanted = match &ctx.state().model {
            Some(name) => models.iter().position(|m| m == name),
            None => (!models.is_empty()).then_some(0),
        };
        let selected = publish_selection(ctx.sheet(), "model", &models, None, wanted)?;
        let model = selected.map(|i| models[i].clone());
        self.slot.request(model.clone());

        let threshold =
            publish_number(ctx.sheet(), "threshold", ctx.state().threshold.unwrap_or(DEFAULT_THRESHOLD))?;
        let max_faces =
            publish_number(ctx.sheet(), "max_faces", ctx.state().max_faces.unwrap_or(DEFAULT_MAX_FACES))?;
        let smoothing = publish_number(
            ctx.sheet(),
            "temporal_smoothing",
            ctx.state().temporal_smoothing.unwrap_or(DEFAULT_TEMPORAL_SMOOTHING),
        )?;
        let sort_by = ctx.state().sort_by.unwrap_or_default();
        let sort_idx = SortBy::all().iter().position(|s| *s == sort_by);
        ctx.sheet().selection("sort_by")?.enable();
        ctx.sheet().selection("sort_by")?.set_selected_index(sort_idx, false)?;

        let state = ctx.state_mut();
        state.model = model;
        state.threshold = Some(threshold);
        state.max_faces = Some(max_faces);
        state.sort_by = Some(sort_by);
        state.temporal_smoothing = Some(smoothing);
        self.frames.reset();
        self.history.clear();
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<DetectorState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        if self.frames.observe(env.frame_num) {
            tracing::debug!("{}: source looped at frame {}", ctx.name(), env.frame_num);
            self.history.clear();
        }

        let threshold = ctx.state().threshold.unwrap_or(DEFAULT_THRESHOLD) as f32;
        let max_faces = ctx.state().max_faces.unwrap_or(DEFAULT_MAX_FACES) as usize;
        let sort_by = ctx.state().sort_by.unwrap_or_default();
        let window = ctx
            .state()
            .temporal_smoothing
            .unwrap_or(DEFAULT_TEMPORAL_SMOOTHING) as usize;

        let frame = env.get_image(FRAME_KEY)?;
        let detected = match (self.slot.ensure_loaded(ctx), frame, env.frame_size) {
            (Some(model), Some(frame), Some(size)) => {
                let mut rects = model.detect(&frame, size, threshold)?;
                sort_by.sort(&mut rects, (size.width as f32 / 2.0, size.height as f32 / 2.0));
                if max_faces > 0 {
                    rects.truncate(max_faces);
                }
                rects
            }
            _ => Vec::new(),
        };
        let detected = self.smooth(detected, window);

        env.face_records = detected.into_iter().map(FaceRecord::from_rect).collect();
        ctx.emit(env);
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut WorkerContext<DetectorState>) {
        self.slot.unload();
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<DetectorState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "model" => {
                if let Some(model) = accept_choice(ctx.sheet(), change)? {
                    self.slot.request(model.clone());
                    ctx.state_mut().model = model;
                }
            }
            "threshold" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().threshold = Some(v);
                }
            }
            "max_faces" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().max_faces = Some(v);
                }
            }
            "temporal_smoothing" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().temporal_smoothing = Some(v);
                    self.history.clear();
                }
            }
            "sort_by" => {
                let Some(idx) = change.value().and_then(FieldValue::as_selection) else {
                    return Ok(());
                };
                ctx.state_mut().sort_by = idx.and_then(|i| SortBy::all().get(i).copied());
            }
            _ => return Ok(()),
        }
        ctx.save_state();
        ctx.reemit_frame();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Envelope, StageKind};
    use crate::stages::collaborators::MockFaceDetector;
    use crate::stages::synthetic::{CenterFaceDetector, StaticModelLoader};
    use crate::stages::test_support::Harness;
    use crate::types::FrameSize;

    fn frame_envelope(h: &Harness<DetectorWorker>, frame_num: u64) -> Envelope {
        let size = FrameSize::new(8, 8, 1);
        let mut env = Envelope::new(frame_num, 0.0);
        env.assign_weak_heap(&h.heap);
        env.frame_size = Some(size);
        env.set_image(FRAME_KEY, vec![0u8; size.byte_len()]).unwrap();
        env
    }

    fn loader_with_faces(faces: Vec<FaceRect>) -> Arc<dyn ModelLoader<dyn FaceDetector>> {
        Arc::new(StaticModelLoader::<dyn FaceDetector>::new().with_model("mock", move || {
            let faces = faces.clone();
            let mut m = MockFaceDetector::new();
            m.expect_detect().returning(move |_, _, _| Ok(faces.clone()));
            Box::new(m)
        }))
    }

    #[test]
    fn test_sort_orders() {
        let small = FaceRect::new(0.0, 0.0, 1.0, 1.0);
        let big = FaceRect::new(5.0, 5.0, 3.0, 3.0);
        let mut rects = vec![small, big];
        SortBy::Largest.sort(&mut rects, (0.0, 0.0));
        assert_eq!(rects, vec![big, small]);
        SortBy::LeftRight.sort(&mut rects, (0.0, 0.0));
        assert_eq!(rects, vec![small, big]);
        SortBy::BottomTop.sort(&mut rects, (0.0, 0.0));
        assert_eq!(rects, vec![big, small]);
    }

    #[test]
    fn test_detects_sorts_and_truncates() {
        let small = FaceRect::new(0.0, 0.0, 1.0, 1.0);
        let big = FaceRect::new(2.0, 2.0, 4.0, 4.0);
        let mut h = Harness::new(
            StageKind::FaceDetector,
            DetectorWorker::new(loader_with_faces(vec![small, big])),
        );
        h.start();
        assert_eq!(h.host.selection("model").unwrap().get_selected_choice(), Some("mock".into()));

        h.feed(&frame_envelope(&h, 1));
        h.tick();
        let out = h.take_output().unwrap();
        assert_eq!(out.face_records.len(), 1);
        assert_eq!(out.face_records[0].rect, Some(big));
        assert!(!h.ctx.is_busy());
    }

    #[test]
    fn test_threshold_change_reemits_and_persists() {
        let loader: Arc<dyn ModelLoader<dyn FaceDetector>> = Arc::new(
            StaticModelLoader::<dyn FaceDetector>::new()
                .with_model("center", || Box::new(CenterFaceDetector)),
        );
        let mut h = Harness::new(StageKind::FaceDetector, DetectorWorker::new(loader));
        h.start();
        let generation = h.reemit.generation();

        h.control("threshold", FieldValue::Number(0.95));
        assert_eq!(h.ctx.state().threshold, Some(0.95));
        assert!(h.reemit.generation() > generation);

        h.feed(&frame_envelope(&h, 1));
        h.tick();
        assert!(h.take_output().unwrap().face_records.is_empty());
    }

    struct Drifting(VecDeque<FaceRect>);

    impl FaceDetector for Drifting {
        fn detect(&mut self, _: &[u8], _: FrameSize, _: f32) -> Result<Vec<FaceRect>, StageError> {
            Ok(self.0.pop_front().into_iter().collect())
        }
    }

    #[test]
    fn test_temporal_smoothing_resets_when_source_loops() {
        let rects: VecDeque<FaceRect> = [0.0, 4.0, 8.0, 2.0]
            .iter()
            .map(|&x| FaceRect::new(x, 0.0, 2.0, 2.0))
            .collect();
        let loader: Arc<dyn ModelLoader<dyn FaceDetector>> = Arc::new(
            StaticModelLoader::<dyn FaceDetector>::new()
                .with_model("drift", move || {
                    Box::new(Drifting(rects.clone())) as Box<dyn FaceDetector>
                }),
        );
        let mut h = Harness::new(StageKind::FaceDetector, DetectorWorker::new(loader));
        h.start();
        h.control("temporal_smoothing", FieldValue::Number(2.0));
        assert_eq!(h.ctx.state().temporal_smoothing, Some(2.0));

        let mut xs = Vec::new();
        for frame_num in [1, 2, 3, 0] {
            h.feed(&frame_envelope(&h, frame_num));
            h.tick();
            let out = h.take_output().unwrap();
            xs.push(out.face_records[0].rect.unwrap().x);
        }
        // Averages of (0), (0, 4), (4, 8), then a fresh start after the loop.
        assert_eq!(xs, vec![0.0, 2.0, 6.0, 2.0]);
    }

    #[test]
    fn test_model_load_failure_reported_once() {
        struct Failing;
        impl ModelLoader<dyn FaceDetector> for Failing {
            fn available(&self) -> Vec<String> {
                vec!["broken".into()]
            }
            fn load(&self, name: &str) -> Result<Box<dyn FaceDetector>, StageError> {
                Err(StageError::ModelLoad {
                    model: name.into(),
                    reason: "corrupt weights".into(),
                })
            }
        }
        let mut h = Harness::new(StageKind::FaceDetector, DetectorWorker::new(Arc::new(Failing)));
        h.start();
        h.feed(&frame_envelope(&h, 1));
        h.tick();
        assert!(h.error().unwrap().contains("corrupt weights"));
        // Frame still passes through, without faces.
        assert!(h.take_output().unwrap().face_records.is_empty());
        assert!(!h.ctx.is_busy());
    }
}
