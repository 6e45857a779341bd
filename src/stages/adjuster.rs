//! Frame adjuster stage: post-processes swapped faces before merging.

use super::collaborators::FrameAdjuster;
use super::{accept_number, publish_number};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, NumberConfig, SheetBuilder};
use crate::types::swap_key;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjusterState {
    /// Defaults to 0.
    pub median_blur_per: Option<f64>,
    /// Defaults to 0.
    pub degrade_bicubic_per: Option<f64>,
}

pub struct AdjusterWorker {
    adjuster: Box<dyn FrameAdjuster>,
}

impl AdjusterWorker {
    pub fn new(adjuster: Box<dyn FrameAdjuster>) -> Self {
        Self { adjuster }
    }
}

impl StageWorker for AdjusterWorker {
    type State = AdjusterState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .number("median_blur_per", NumberConfig::int(0, 100))
            .number("degrade_bicubic_per", NumberConfig::int(0, 100));
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<AdjusterState>) -> Result<(), StageError> {
        let blur = publish_number(
            ctx.sheet(),
            "median_blur_per",
            ctx.state().median_blur_per.unwrap_or(0.0),
        )?;
        let degrade = publish_number(
            ctx.sheet(),
            "degrade_bicubic_per",
            ctx.state().degrade_bicubic_per.unwrap_or(0.0),
        )?;
        let state = ctx.state_mut();
        state.median_blur_per = Some(blur);
        state.degrade_bicubic_per = Some(degrade);
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<AdjusterState>) -> Result<(), StageError> {
        if !ctx.flush_output() {
            return Ok(());
        }
        let Some(mut env) = ctx.read_input(0) else {
            return Ok(());
        };
        let blur = ctx.state().median_blur_per.unwrap_or(0.0) as u32;
        let degrade = ctx.state().degrade_bicubic_per.unwrap_or(0.0) as u32;

        if blur > 0 || degrade > 0 {
            for idx in 0..env.face_records.len() {
                let Some(face) = env.get_image(&swap_key(idx))? else {
                    continue;
                };
                let adjusted = self.adjuster.adjust(&face, blur, degrade)?;
                env.set_image(swap_key(idx), adjusted)?;
            }
        }
        ctx.emit(env);
        Ok(())
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<AdjusterState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        let Some(v) = accept_number(ctx.sheet(), change)? else {
            return Ok(());
        };
        match change.field.as_str() {
            "median_blur_per" => ctx.state_mut().median_blur_per = Some(v),
            "degrade_bicubic_per" => ctx.state_mut().degrade_bicubic_per = Some(v),
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
    use crate::stages::collaborators::MockFrameAdjuster;
    use crate::stages::test_support::Harness;
    use crate::types::{FaceRecord, FaceRect};

    fn envelope(h: &Harness<AdjusterWorker>) -> Envelope {
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&h.heap);
        env.face_records = vec![FaceRecord::from_rect(FaceRect::default())];
        env.set_image(swap_key(0), vec![1u8, 2, 3]).unwrap();
        env
    }

    #[test]
    fn test_zero_settings_skip_collaborator() {
        let mut adjuster = MockFrameAdjuster::new();
        adjuster.expect_adjust().never();
        let mut h = Harness::new(StageKind::FrameAdjuster, AdjusterWorker::new(Box::new(adjuster)));
        h.start();
        let env = envelope(&h);
        let handle = env.image_handle(&swap_key(0));
        h.feed(&env);
        h.tick();
        assert_eq!(h.take_output().unwrap().image_handle(&swap_key(0)), handle);
    }

    #[test]
    fn test_rewrites_swap_image() {
        let mut adjuster = MockFrameAdjuster::new();
        adjuster
            .expect_adjust()
            .withf(|_, blur, degrade| *blur == 50 && *degrade == 0)
            .returning(|face, _, _| Ok(face.iter().rev().copied().collect()));
        let mut h = Harness::new(StageKind::FrameAdjuster, AdjusterWorker::new(Box::new(adjuster)));
        h.start();
        h.control("median_blur_per", FieldValue::Number(50.0));
        h.feed(&envelope(&h));
        h.tick();
        let out = h.take_output().unwrap();
        assert_eq!(&out.get_image(&swap_key(0)).unwrap().unwrap()[..], &[3, 2, 1]);
    }
}
