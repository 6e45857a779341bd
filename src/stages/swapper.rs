//! Face swapper stage.

use super::collaborators::{FaceSwapModel, ModelLoader};
use super::{accept_choice, accept_number, publish_number, publish_selection, ModelSlot, LOAD_PROGRESS_FIELD};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, NumberConfig, SelectionConfig, SheetBuilder};
use crate::types::{align_key, swap_key, swap_mask_key};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MODEL_NONE_CHOICE: &str = "No model";
pub const DEFAULT_MORPH_FACTOR: f64 = 0.75;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapperState {
    /// Defaults to none: a swap model is never picked implicitly.
    pub model: Option<String>,
    /// Defaults to 0.
    pub face_id: Option<f64>,
    pub morph_factor: Option<f64>,
}

pub struct SwapperWorker {
    slot: ModelSlot<dyn FaceSwapModel>,
}

impl SwapperWorker {
    pub fn new(loader: Arc<dyn ModelLoader<dyn FaceSwapModel>>) -> Self {
        Self {
            slot: ModelSlot::new(loader),
        }
    }
}

impl StageWorker for SwapperWorker {
    type State = SwapperState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection(
                "model",
                SelectionConfig::default().with_none_choice(MODEL_NONE_CHOICE),
            )
            .number("face_id", NumberConfig::int(0, 15))
            .number("morph_factor", NumberConfig::new(0.0, 1.0, 0.01, 2))
            .progress(LOAD_PROGRESS_FIELD);
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<SwapperState>) -> Result<(), StageError> {
        let models = self.slot.available();
        let wanted = ctx
            .state()
            .model
            .as_ref()
            .and_then(|name| models.iter().position(|m| m == name));
        if wanted.is_none() {
            if let Some(missing) = &ctx.state().model {
                tracing::warn!("{}: saved model '{}' is no longer available", ctx.name(), missing);
            }
        }
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
        let morph = publish_number(
            ctx.sheet(),
            "morph_factor",
            ctx.state().morph_factor.unwrap_or(DEFAULT_MORPH_FACTOR),
        )?;
        let state = ctx.state_mut();
        state.model = model;
        state.face_id = Some(face_id);
        state.morph_factor = Some(morph);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<SwapperState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let face_id = ctx.state().face_id.unwrap_or(0.0) as usize;
        let morph = ctx.state().morph_factor.unwrap_or(DEFAULT_MORPH_FACTOR) as f32;

        let aligned = env.get_image(&align_key(face_id))?;
        if let (Some(model), Some(aligned)) = (self.slot.ensure_loaded(ctx), aligned) {
            if face_id < env.face_records.len() {
                let swapped = model.swap(&aligned, morph)?;
                env.set_image(swap_key(face_id), swapped.image)?;
                env.set_image(swap_mask_key(face_id), swapped.mask)?;
                let face = &mut env.face_records[face_id];
                face.swap_image_name = Some(swap_key(face_id));
                face.swap_mask_name = Some(swap_mask_key(face_id));
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut WorkerContext<SwapperState>) {
        self.slot.unload();
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<SwapperState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "model" => {
                if let Some(model) = accept_choice(ctx.sheet(), change)? {
                    if self.slot.wanted() != model.as_deref() {
                        tracing::info!("{}: model set to {:?}", ctx.name(), model);
                    }
                    self.slot.request(model.clone());
                    ctx.state_mut().model = model;
                }
            }
            "face_id" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().face_id = Some(v);
                }
            }
            "morph_factor" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().morph_factor = Some(v);
                }
            }
            _ => return Ok(()),
        }
        ctx.save_state();
        ctx.reemit_frame();
        Ok(())
    }
}
