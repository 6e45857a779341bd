//! Face aligner stage.

use super::collaborators::FaceAligner;
use super::{accept_flag, accept_number, publish_flag, publish_number};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, NumberConfig, SheetBuilder};
use crate::types::{align_key, align_mask_key, FRAME_KEY};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FACE_COVERAGE: f64 = 2.2;
pub const DEFAULT_RESOLUTION: f64 = 224.0;
pub const DEFAULT_EXCLUDE_MOVING_PARTS: bool = true;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignerState {
    pub face_coverage: Option<f64>,
    pub resolution: Option<f64>,
    pub exclude_moving_parts: Option<bool>,
}

pub struct AlignerWorker {
    aligner: Box<dyn FaceAligner>,
}

impl AlignerWorker {
    pub fn new(aligner: Box<dyn FaceAligner>) -> Self {
        Self { aligner }
    }
}

impl StageWorker for AlignerWorker {
    type State = AlignerState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .number("face_coverage", NumberConfig::new(0.1, 4.0, 0.1, 1))
            .number("resolution", NumberConfig::new(16.0, 1024.0, 16.0, 0))
            .flag("exclude_moving_parts");
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<AlignerState>) -> Result<(), StageError> {
        let s = ctx.state().clone();
        let coverage = publish_number(
            ctx.sheet(),
            "face_coverage",
            s.face_coverage.unwrap_or(DEFAULT_FACE_COVERAGE),
        )?;
        let resolution =
            publish_number(ctx.sheet(), "resolution", s.resolution.unwrap_or(DEFAULT_RESOLUTION))?;
        let exclude = s.exclude_moving_parts.unwrap_or(DEFAULT_EXCLUDE_MOVING_PARTS);
        publish_flag(ctx.sheet(), "exclude_moving_parts", exclude)?;

        let state = ctx.state_mut();
        state.face_coverage = Some(coverage);
        state.resolution = Some(resolution);
        state.exclude_moving_parts = Some(exclude);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<AlignerState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let s = ctx.state();
        let coverage = s.face_coverage.unwrap_or(DEFAULT_FACE_COVERAGE) as f32;
        let resolution = s.resolution.unwrap_or(DEFAULT_RESOLUTION) as u32;
        let exclude = s.exclude_moving_parts.unwrap_or(DEFAULT_EXCLUDE_MOVING_PARTS);

        if let (Some(frame), Some(size)) = (env.get_image(FRAME_KEY)?, env.frame_size) {
            for idx in 0..env.face_records.len() {
                if env.face_records[idx].rect.is_none() {
                    continue;
                }
                let aligned = self.aligner.align(
                    &frame,
                    size,
                    &env.face_records[idx],
                    coverage,
                    resolution,
                    exclude,
                )?;
                env.set_image(align_key(idx), aligned.image)?;
                env.set_image(align_mask_key(idx), aligned.mask)?;
                let face = &mut env.face_records[idx];
                face.align_image_name = Some(align_key(idx));
                face.align_mask_name = Some(align_mask_key(idx));
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<AlignerState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "face_coverage" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().face_coverage = Some(v);
                }
            }
            "resolution" => {
                if let Some(v) = accept_number(ctx.sheet(), change)? {
                    ctx.state_mut().resolution = Some(v);
                }
            }
            "exclude_moving_parts" => {
                if let Some(v) = accept_flag(change) {
                    ctx.state_mut().exclude_moving_parts = Some(v);
                }
            }
            _ => return Ok(()),
        }
        ctx.save_state();
        ctx.reemit_frame();
        Ok(())
    }
}
