//! Stream output stage: shows or records one image per envelope.

use super::collaborators::{FrameSink, OutputFrame, SequenceOpener};
use super::{accept_flag, publish_flag, publish_selection};
use crate::backend::{StageError, StageWorker, WorkerContext};
use crate::control::{FieldChange, FieldValue, SelectionConfig, SheetBuilder};
use crate::pipeline::Envelope;
use crate::types::{align_key, swap_key, FRAME_KEY, MERGED_KEY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which envelope image the output shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputSource {
    SourceFrame,
    AlignedFace,
    SwappedFace,
    #[default]
    MergedFrame,
}

impl OutputSource {
    pub fn all() -> &'static [OutputSource] {
        &[
            OutputSource::SourceFrame,
            OutputSource::AlignedFace,
            OutputSource::SwappedFace,
            OutputSource::MergedFrame,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            OutputSource::SourceFrame => "Source frame",
            OutputSource::AlignedFace => "Aligned face",
            OutputSource::SwappedFace => "Swapped face",
            OutputSource::MergedFrame => "Merged frame",
        }
    }

    /// Envelope key of the image to show. Faces use the first face.
    pub fn image_key(&self) -> String {
        match self {
            OutputSource::SourceFrame => FRAME_KEY.to_string(),
            OutputSource::AlignedFace => align_key(0),
            OutputSource::SwappedFace => swap_key(0),
            OutputSource::MergedFrame => MERGED_KEY.to_string(),
        }
    }

    /// Whole frames carry the envelope's frame size; face crops don't.
    fn is_frame(&self) -> bool {
        matches!(self, OutputSource::SourceFrame | OutputSource::MergedFrame)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    pub source_type: Option<OutputSource>,
    /// Defaults to on.
    pub show_preview: Option<bool>,
    /// Defaults to off.
    pub save_sequence: Option<bool>,
    /// Defaults to empty; saving needs a path.
    pub sequence_path: Option<String>,
}

pub struct OutputWorker {
    preview: Box<dyn FrameSink>,
    open_sequence: SequenceOpener,
    sequence: Option<Box<dyn FrameSink>>,
}

impl OutputWorker {
    pub fn new(preview: Box<dyn FrameSink>, open_sequence: SequenceOpener) -> Self {
        Self {
            preview,
            open_sequence,
            sequence: None,
        }
    }

    /// Open or close the sequence writer to match the state.
    fn sync_sequence(&mut self, ctx: &mut WorkerContext<OutputState>) -> Result<(), StageError> {
        self.sequence = None;
        let state = ctx.state();
        if !state.save_sequence.unwrap_or(false) {
            return Ok(());
        }
        let path = state.sequence_path.clone().unwrap_or_default();
        if path.trim().is_empty() {
            return Err(StageError::collaborator("sequence path is not set"));
        }
        let dir = PathBuf::from(path);
        self.sequence = Some((self.open_sequence)(&dir)?);
        tracing::info!("{}: saving sequence to {}", ctx.name(), dir.display());
        ctx.clear_error();
        Ok(())
    }

    fn output_frame(env: &Envelope, source: OutputSource) -> Result<Option<OutputFrame>, StageError> {
        let Some(image) = env.get_image(&source.image_key())? else {
            return Ok(None);
        };
        Ok(Some(OutputFrame {
            uid: env.uid(),
            frame_num: env.frame_num,
            timestamp: env.frame_timestamp,
            size: if source.is_frame() { env.frame_size } else { None },
            image,
        }))
    }
}

impl StageWorker for OutputWorker {
    type State = OutputState;

    fn declare_controls(builder: &mut SheetBuilder) {
        builder
            .selection(
                "source_type",
                SelectionConfig::new(OutputSource::all().iter().map(OutputSource::display_name)),
            )
            .flag("show_preview")
            .flag("save_sequence")
            .text("sequence_path");
    }

    fn on_start(&mut self, ctx: &mut WorkerContext<OutputState>) -> Result<(), StageError> {
        let s = ctx.state().clone();
        let names: Vec<String> = OutputSource::all()
            .iter()
            .map(|o| o.display_name().to_string())
            .collect();
        let source = s.source_type.unwrap_or_default();
        let idx = OutputSource::all().iter().position(|o| *o == source);
        publish_selection(ctx.sheet(), "source_type", &names, None, idx)?;
        let show = s.show_preview.unwrap_or(true);
        publish_flag(ctx.sheet(), "show_preview", show)?;
        let save = s.save_sequence.unwrap_or(false);
        publish_flag(ctx.sheet(), "save_sequence", save)?;
        let path = s.sequence_path.clone().unwrap_or_default();
        let path_field = ctx.sheet().text("sequence_path")?;
        path_field.enable();
        path_field.set_text(path.clone(), false);

        let state = ctx.state_mut();
        state.source_type = Some(source);
        state.show_preview = Some(show);
        state.save_sequence = Some(save);
        state.sequence_path = Some(path);

        if let Err(e) = self.sync_sequence(ctx) {
            ctx.report_error(e);
        }
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut WorkerContext<OutputState>) -> Result<(), StageError> {
        let Some(env) = ctx.read_input(0) else {
            return Ok(());
        };
        let source = ctx.state().source_type.unwrap_or_default();
        let Some(frame) = Self::output_frame(&env, source)? else {
            tracing::trace!("{}: frame {} has no {:?}", ctx.name(), env.frame_num, source);
            return Ok(());
        };
        if ctx.state().show_preview.unwrap_or(true) {
            self.preview.show(&frame)?;
        }
        if let Some(sequence) = self.sequence.as_mut() {
            sequence.show(&frame)?;
        }
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut WorkerContext<OutputState>) {
        self.sequence = None;
    }

    fn on_control(
        &mut self,
        ctx: &mut WorkerContext<OutputState>,
        change: &FieldChange,
    ) -> Result<(), StageError> {
        match change.field.as_str() {
            "source_type" => {
                let Some(idx) = change.value().and_then(FieldValue::as_selection) else {
                    return Ok(());
                };
                ctx.state_mut().source_type = idx.and_then(|i| OutputSource::all().get(i).copied());
                ctx.save_state();
                ctx.reemit_frame();
            }
            "show_preview" => {
                if let Some(v) = accept_flag(change) {
                    ctx.state_mut().show_preview = Some(v);
                    ctx.save_state();
                    ctx.reemit_frame();
                }
            }
            "save_sequence" => {
                if let Some(v) = accept_flag(change) {
                    ctx.state_mut().save_sequence = Some(v);
                    ctx.save_state();
                    self.sync_sequence(ctx)?;
                }
            }
            "sequence_path" => {
                if let Some(path) = change.value().and_then(FieldValue::as_text) {
                    ctx.state_mut().sequence_path = Some(path.to_string());
                    ctx.save_state();
                    self.sync_sequence(ctx)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
