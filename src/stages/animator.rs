//! Face animator stage: drives the aligned face with a motion model.

use super::collaborators::{FaceAnimatorModel, ModelLoader};
use super::{accept_choice, accept_number, publish_number, publish_selection, ModelSlot, LOAD_PROGRESS_FIELD};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, NumberConfig, SelectionConfig, SheetBuilder};
use crate::types::{align_key, swap_key};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MODEL_NONE_CHOICE: &str = "No model";
pub const DEFAULT_RELATIVE_POWER: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimatorState {
    /// Defaults to none.
    pub model: Option<String>,
    /// Defaults to 0.
    pub face_id: Option<f64>,
    pub relative_power: Option<f64>,
}

pub struct AnimatorWorker {
    slot: ModelSlot<dyn FaceAnimatorModel>,
}

impl AnimatorWorker {
    pub fn new(loader: Arc<dyn ModelLoader<dyn FaceAnimatorModel>>) -> Self {
        Self {
            slot: ModelSlot::new(loader),
        }
    }
}

impl StageWorker for AnimatorWorker {
    type State = AnimatorState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection(
                "model",
                SelectionConfig::default().with_none_choice(MODEL_NONE_CHOICE),
            )
            .number("face_id", NumberConfig::int(0, 15))
            .number("relative_power", NumberConfig::new(0.0, 2.0, 0.01, 2))
            .progress(LOAD_PROGRESS_FIELD);
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<AnimatorState>) -> Result<(), StageError> {
        let models = self.slot.available();
        let wanted = ctx
            .state()
            .model
            .as_ref()
            .and_then(|name| models.iter().position(|m| m == name));
        let selected = publish_selection(
            ctx.sheet(),
            "model",
            &models,
            Some(MODEL_NONE_CHOICE),
            wanted,
        )?;
        let model = selected.map(|i| models[i].clone());
        self.slot.request(model.clone());

        let face_id = publish_number(ctx.sheet(), "face_id", ctx.state().face_id.unwrap_or(0.0))?;
        let power = publish_number(
            ctx.sheet(),
            "relative_power",
            ctx.state().relative_power.unwrap_or(DEFAULT_RELATIVE_POWER),
        )?;
        let state = ctx.state_mut();
        state.model = model;
        state.face_id = Some(face_id);
        state.relative_power = Some(power);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<AnimatorState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let face_id = ctx.state().face_id.unwrap_or(0.0) as usize;
        let power = ctx.state().relative_power.unwrap_or(DEFAULT_RELATIVE_POWER) as f32;

        let aligned = env.get_image(&align_key(face_id))?;
        if let (Some(model), Some(aligned)) = (self.slot.ensure_loaded(ctx), aligned) {
            if face_id < env.face_records.len() {
                let animated = model.animate(&aligned, power)?;
                env.set_image(swap_key(face_id), animated)?;
                env.face_records[face_id].swap_image_name = Some(swap_key(face_id));
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut WorkerContext<AnimatorState>) {
        self.slot.unload();
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<AnimatorState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "model" => {
                if let Some(model) = accept_choice(ctx.sheet(), change)? {
                    self.slot.request(model.clone());
                    ctx.state_mut().model = model;
                }
            }
            "face_id" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().face_id = Some(v);
                }
            }
            "relative_power" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().relative_power = Some(v);
                }
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
    use crate::control::FieldValue;
    use crate::pipeline::{Envelope, StageKind};
    use crate::stages::collaborators::MockFaceAnimatorModel;
    use crate::stages::synthetic::StaticModelLoader;
    use crate::stages::test_support::Harness;
    use crate::types::{FaceRecord, FaceRect};

    fn loader() -> Arc<dyn ModelLoader<dyn FaceAnimatorModel>> {
        Arc::new(StaticModelLoader::<dyn FaceAnimatorModel>::new().with_model("doubler", || {
            let mut m = MockFaceAnimatorModel::new();
            m.expect_animate()
                .returning(|face, power| Ok(face.iter().map(|b| (*b as f32 * power) as u8).collect()));
            Box::new(m)
        }))
    }

    fn envelope(h: &Harness<AnimatorWorker>) -> Envelope {
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&h.heap);
        env.face_records = vec![FaceRecord::from_rect(FaceRect::default())];
        env.set_image(align_key(0), vec![10u8, 20]).unwrap();
        env
    }

    #[test]
    fn test_no_model_by_default_passes_through() {
        let mut h = Harness::new(StageKind::FaceAnimator, AnimatorWorker::new(loader()));
        h.start();
        assert_eq!(h.host.selection("model").unwrap().get_selected_index(), None);
        h.feed(&envelope(&h));
        h.tick();
        let out = h.take_output().unwrap();
        assert!(!out.has_image(&swap_key(0)));
    }

    #[test]
    fn test_selected_model_animates_face() {
        let mut h = Harness::new(StageKind::FaceAnimator, AnimatorWorker::new(loader()));
        h.start();
        h.control("model", FieldValue::Selection(Some(0)));
        h.control("relative_power", FieldValue::Number(2.0));
        assert_eq!(h.ctx.state().model.as_deref(), Some("doubler"));

        h.feed(&envelope(&h));
        h.tick();
        let out = h.take_output().unwrap();
        assert_eq!(&out.get_image(&swap_key(0)).unwrap().unwrap()[..], &[20, 40]);
        assert_eq!(out.face_records[0].swap_image_name.as_deref(), Some("face0_swap"));
    }
}
