//! Face merger stage: pastes swapped faces back into the source frame.

use super::collaborators::{FaceMaskType, FaceMerger, MergeFace, MergeParams};
use super::{accept_number, publish_number, publish_selection};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, FieldValue, NumberConfig, SelectionConfig, SheetBuilder};
use crate::pipeline::Envelope;
use crate::types::{swap_key, swap_mask_key, FRAME_KEY, MERGED_KEY};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FACE_MASK_TYPE: usize = 2;
pub const DEFAULT_FACE_OPACITY: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergerState {
    /// Defaults to 0.
    pub face_x_offset: Option<f64>,
    /// Defaults to 0.
    pub face_y_offset: Option<f64>,
    /// Index into [`FaceMaskType::NAMES`].
    pub face_mask_type: Option<usize>,
    pub face_opacity: Option<f64>,
}

impl MergerState {
    fn params(&self) -> MergeParams {
        MergeParams {
            x_offset: self.face_x_offset.unwrap_or(0.0) as f32,
            y_offset: self.face_y_offset.unwrap_or(0.0) as f32,
            mask_type: FaceMaskType::from_index(self.face_mask_type.unwrap_or(DEFAULT_FACE_MASK_TYPE)),
            opacity: self.face_opacity.unwrap_or(DEFAULT_FACE_OPACITY) as f32,
        }
    }
}

pub struct MergerWorker {
    merger: Box<dyn FaceMerger>,
}

impl MergerWorker {
    pub fn new(merger: Box<dyn FaceMerger>) -> Self {
        Self { merger }
    }

    fn collect_faces(env: &Envelope) -> Result<Vec<MergeFace>, StageError> {
        let mut faces = Vec::new();
        for (idx, record) in env.face_records.iter().enumerate() {
            let (Some(rect), Some(image)) = (record.rect, env.get_image(&swap_key(idx))?) else {
                continue;
            };
            faces.push(MergeFace {
                rect,
                image,
                mask: env.get_image(&swap_mask_key(idx))?,
            });
        }
        Ok(faces)
    }
}

impl StageWorker for MergerWorker {
    type State = MergerState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .number("face_x_offset", NumberConfig::new(-0.5, 0.5, 0.001, 3))
            .number("face_y_offset", NumberConfig::new(-0.5, 0.5, 0.001, 3))
            .selection("face_mask_type", SelectionConfig::new(FaceMaskType::NAMES))
            .number("face_opacity", NumberConfig::new(0.0, 1.0, 0.01, 2));
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<MergerState>) -> Result<(), StageError> {
        let s = ctx.state().clone();
        let x = publish_number(ctx.sheet(), "face_x_offset", s.face_x_offset.unwrap_or(0.0))?;
        let y = publish_number(ctx.sheet(), "face_y_offset", s.face_y_offset.unwrap_or(0.0))?;
        let names: Vec<String> = FaceMaskType::NAMES.iter().map(|n| n.to_string()).collect();
        let mask = publish_selection(
            ctx.sheet(),
            "face_mask_type",
            &names,
            None,
            Some(s.face_mask_type.unwrap_or(DEFAULT_FACE_MASK_TYPE)),
        )?;
        let opacity =
            publish_number(ctx.sheet(), "face_opacity", s.face_opacity.unwrap_or(DEFAULT_FACE_OPACITY))?;

        let state = ctx.state_mut();
        state.face_x_offset = Some(x);
        state.face_y_offset = Some(y);
        state.face_mask_type = mask.or(Some(DEFAULT_FACE_MASK_TYPE));
        state.face_opacity = Some(opacity);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<MergerState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let faces = Self::collect_faces(&env)?;
        match (env.get_image(FRAME_KEY)?, env.frame_size) {
            (Some(frame), Some(size)) if !faces.is_empty() => {
                let merged = self.merger.merge(&frame, size, &faces, &ctx.state().params())?;
                env.set_image(MERGED_KEY, merged)?;
            }
            _ => {
                // Nothing to merge: the output is the source frame itself.
                if let Some(handle) = env.image_handle(FRAME_KEY) {
                    env.set_image_handle(MERGED_KEY, handle);
                }
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<MergerState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "face_mask_type" => {
                let Some(idx) = change.value().and_then(FieldValue::as_selection) else {
                    return Ok(());
                };
                ctx.state_mut().face_mask_type = idx;
            }
            field => {
                let Some(v) = accept_number(ctx.sheet(), change)? else {
                    return Ok(());
                };
                let state = ctx.state_mut();
                match field {
                    "face_x_offset" => state.face_x_offset = Some(v),
                    "face_y_offset" => state.face_y_offset = Some(v),
                    "face_opacity" => state.face_opacity = Some(v),
                    _ => return Ok(()),
                }
            }
        }
        ctx.save_state();
        ctx.reemit_frame();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageKind;
    use crate::stages::collaborators::MockFaceMerger;
    use crate::stages::test_support::Harness;
    use crate::types::{FaceRecord, FaceRect, FrameSize};

    fn envelope(h: &Harness<MergerWorker>, with_swap: bool) -> Envelope {
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&h.heap);
        env.frame_size = Some(FrameSize::new(2, 2, 1));
        env.set_image(FRAME_KEY, vec![0u8; 4]).unwrap();
        env.face_records = vec![FaceRecord::from_rect(FaceRect::new(0.0, 0.0, 1.0, 1.0))];
        if with_swap {
            env.set_image(swap_key(0), vec![9u8]).unwrap();
        }
        env
    }

    #[test]
    fn test_falls_back_to_frame_handle() {
        let mut merger = MockFaceMerger::new();
        merger.expect_merge().never();
        let mut h = Harness::new(StageKind::FaceMerger, MergerWorker::new(Box::new(merger)));
        h.start();
        let env = envelope(&h, false);
        h.feed(&env);
        h.tick();
        let out = h.take_output().unwrap();
        assert_eq!(out.image_handle(MERGED_KEY), env.image_handle(FRAME_KEY));
    }

    #[test]
    fn test_merges_with_current_params() {
        let mut merger = MockFaceMerger::new();
        merger
            .expect_merge()
            .withf(|_, _, faces, params| {
                faces.len() == 1
                    && faces[0].mask.is_none()
                    && params.opacity == 0.5
                    && params.mask_type == FaceMaskType::Source
            })
            .returning(|_, _, _, _| Ok(vec![7u8; 4]));
        let mut h = Harness::new(StageKind::FaceMerger, MergerWorker::new(Box::new(merger)));
        h.start();
        h.control("face_opacity", FieldValue::Number(0.5));
        h.control("face_mask_type", FieldValue::Selection(Some(0)));
        h.feed(&envelope(&h, true));
        h.tick();
        let out = h.take_output().unwrap();
        assert_eq!(&out.get_image(MERGED_KEY).unwrap().unwrap()[..], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_offset_clamped() {
        let mut h = Harness::new(
            StageKind::FaceMerger,
            MergerWorker::new(Box::new(MockFaceMerger::new())),
        );
        h.start();
        h.control("face_x_offset", FieldValue::Number(3.0));
        assert_eq!(h.ctx.state().face_x_offset, Some(0.5));
        assert_eq!(h.host.number("face_x_offset").unwrap().get_number(), 0.5);
    }
}
