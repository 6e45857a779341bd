//! Landmark marker stage.

use super::collaborators::{FaceMarker, ModelLoader};
use super::{
    accept_choice, accept_number, publish_number, publish_selection, ModelSlot, LOAD_PROGRESS_FIELD,
};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, NumberConfig, SelectionConfig, SheetBuilder};
use crate::types::FRAME_KEY;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_MARKER_COVERAGE: f64 = 1.4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerState {
    /// Defaults to the first available model.
    pub model: Option<String>,
    pub marker_coverage: Option<f64>,
}

pub struct MarkerWorker {
    slot: ModelSlot<dyn FaceMarker>,
}

impl MarkerWorker {
    pub fn new(loader: Arc<dyn ModelLoader<dyn FaceMarker>>) -> Self {
        Self {
            slot: ModelSlot::new(loader),
        }
    }
}

impl StageWorker for MarkerWorker {
    type State = MarkerState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection("model", SelectionConfig::default())
            .number("marker_coverage", NumberConfig::new(0.1, 3.0, 0.1, 1))
            .progress(LOAD_PROGRESS_FIELD);
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<MarkerState>) -> Result<(), StageError> {
        let models = self.slot.available();
        let wanted = match &ctx.state().model {
            Some(name) => models.iter().position(|m| m == name),
            None => (!models.is_empty()).then_some(0),
        };
        let selected = publish_selection(ctx.sheet(), "model", &models, None, wanted)?;
        let model = selected.map(|i| models[i].clone());
        self.slot.request(model.clone());

        let coverage = publish_number(
            ctx.sheet(),
            "marker_coverage",
            ctx.state().marker_coverage.unwrap_or(DEFAULT_MARKER_COVERAGE),
        )?;
        let state = ctx.state_mut();
        state.model = model;
        state.marker_coverage = Some(coverage);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<MarkerState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let coverage = ctx.state().marker_coverage.unwrap_or(DEFAULT_MARKER_COVERAGE) as f32;

        let frame = env.get_image(FRAME_KEY)?;
        if let (Some(model), Some(frame), Some(size)) =
            (self.slot.ensure_loaded(ctx), frame, env.frame_size)
        {
            for face in &mut env.face_records {
                let Some(rect) = face.rect else { continue };
                let (landmarks, pose) = model.mark(&frame, size, &rect, coverage)?;
                face.landmarks = Some(landmarks);
                face.pose = Some(pose);
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut WorkerContext<MarkerState>) {
        self.slot.unload();
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<MarkerState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "model" => {
                if let Some(model) = accept_choice(ctx.sheet(), change)? {
                    self.slot.request(model.clone());
                    ctx.state_mut().model = model;
                }
            }
            "marker_coverage" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().marker_coverage = Some(v);
                }
            }
            _ => return Ok(()),
        }
        ctx.save_state();
        ctx.reemit_frame();
        Ok(())
    }
}
