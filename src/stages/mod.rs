//! Concrete pipeline stages
//!
//! One [`StageWorker`](crate::backend::StageWorker) per [`StageKind`], the
//! collaborator traits they call into, and a [`DefaultStageFactory`] that
//! wires them into a [`PipelineGraph`].
//!
//! ```text
//! multi_sources ─► detected ─► marked ─► aligned ─► swapped ─► adjusted ─► merged
//! ```

pub mod collaborators;
pub mod synthetic;

mod adjuster;
mod aligner;
mod animator;
mod detector;
mod marker;
mod merger;
mod output;
mod source;
mod swapper;

pub use adjuster::{AdjusterState, AdjusterWorker};
pub use aligner::{AlignerState, AlignerWorker};
pub use animator::{AnimatorState, AnimatorWorker};
pub use collaborators::*;
pub use detector::{DetectorState, DetectorWorker, SortBy};
pub use marker::{MarkerState, MarkerWorker};
pub use merger::{MergerState, MergerWorker};
pub use output::{OutputSource, OutputState, OutputWorker};
pub use source::{SourceState, SourceWorker};
pub use swapper::{SwapperState, SwapperWorker};

use crate::backend::{StageError, StageHost, StageWiring, WorkerContext};
use crate::control::{FieldChange, FieldValue, WorkerSheet};
use crate::error::Result;
use crate::pipeline::{PipelineGraph, StageFactory, StageKind};
use crate::state::WorkerState;
use std::sync::Arc;

/// Name of the progress field model-backed stages update while loading.
pub const LOAD_PROGRESS_FIELD: &str = "load_progress";

/// Builds every stage kind from a [`Collaborators`] bundle.
#[derive(Debug, Clone)]
pub struct DefaultStageFactory {
    collaborators: Collaborators,
}

impl DefaultStageFactory {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }
}

impl StageFactory for DefaultStageFactory {
    fn create(&self, wiring: StageWiring) -> Result<StageHost> {
        let c = &self.collaborators;
        match wiring.kind {
            StageKind::CameraSource => {
                StageHost::spawn(wiring, SourceWorker::camera((c.camera)()))
            }
            StageKind::FileSource => StageHost::spawn(wiring, SourceWorker::file((c.file)())),
            StageKind::FaceDetector => {
                StageHost::spawn(wiring, DetectorWorker::new(c.detectors.clone()))
            }
            StageKind::FaceMarker => {
                StageHost::spawn(wiring, MarkerWorker::new(c.markers.clone()))
            }
            StageKind::FaceAligner => StageHost::spawn(wiring, AlignerWorker::new((c.aligner)())),
            StageKind::FaceAnimator => {
                StageHost::spawn(wiring, AnimatorWorker::new(c.animators.clone()))
            }
            StageKind::FaceSwapper => {
                StageHost::spawn(wiring, SwapperWorker::new(c.swappers.clone()))
            }
            StageKind::FrameAdjuster => {
                StageHost::spawn(wiring, AdjusterWorker::new((c.adjuster)()))
            }
            StageKind::FaceMerger => StageHost::spawn(wiring, MergerWorker::new((c.merger)())),
            StageKind::StreamOutput => StageHost::spawn(
                wiring,
                OutputWorker::new((c.preview)(), c.sequence.clone()),
            ),
        }
    }
}

/// The standard face-swap chain.
///
/// Camera and file sources share `multi_sources`; animator and swapper
/// share `swapped`. Each pair forms an exclusive group.
pub fn default_graph() -> PipelineGraph {
    let mut g = PipelineGraph::new();
    let sources = g.connection("multi_sources");
    let detected = g.connection("detected");
    let marked = g.connection("marked");
    let aligned = g.connection("aligned");
    let swapped = g.connection("swapped");
    let adjusted = g.connection("adjusted");
    let merged = g.connection("merged");

    g.add_stage(StageKind::CameraSource, &[], Some(sources));
    g.add_stage(StageKind::FileSource, &[], Some(sources));
    g.add_stage(StageKind::FaceDetector, &[sources], Some(detected));
    g.add_stage(StageKind::FaceMarker, &[detected], Some(marked));
    g.add_stage(StageKind::FaceAligner, &[marked], Some(aligned));
    g.add_stage(StageKind::FaceAnimator, &[aligned], Some(swapped));
    g.add_stage(StageKind::FaceSwapper, &[aligned], Some(swapped));
    g.add_stage(StageKind::FrameAdjuster, &[swapped], Some(adjusted));
    g.add_stage(StageKind::FaceMerger, &[adjusted], Some(merged));
    g.add_stage(StageKind::StreamOutput, &[merged], None);
    g
}

/// Notices a source looping back to an earlier frame number.
#[derive(Debug, Default)]
pub(crate) struct FrameLoopTracker {
    prev: Option<u64>,
}

impl FrameLoopTracker {
    /// Returns true when `frame_num` went backwards.
    pub(crate) fn observe(&mut self, frame_num: u64) -> bool {
        let looped = self.prev.is_some_and(|prev| frame_num < prev);
        self.prev = Some(frame_num);
        looped
    }

    pub(crate) fn reset(&mut self) {
        self.prev = None;
    }
}

/// Lazily loaded model selected by name.
///
/// A failed load is not retried until a different model is requested.
pub(crate) struct ModelSlot<M: ?Sized> {
    loader: Arc<dyn ModelLoader<M>>,
    wanted: Option<String>,
    loaded: Option<(String, Box<M>)>,
    failed: Option<String>,
}

impl<M: ?Sized> ModelSlot<M> {
    pub(crate) fn new(loader: Arc<dyn ModelLoader<M>>) -> Self {
        Self {
            loader,
            wanted: None,
            loaded: None,
            failed: None,
        }
    }

    pub(crate) fn available(&self) -> Vec<String> {
        self.loader.available()
    }

    pub(crate) fn request(&mut self, name: Option<String>) {
        if self.wanted != name {
            self.failed = None;
        }
        self.wanted = name;
    }

    pub(crate) fn wanted(&self) -> Option<&str> {
        self.wanted.as_deref()
    }

    pub(crate) fn unload(&mut self) {
        self.loaded = None;
        self.failed = None;
    }

    /// The requested model, loading it first if needed.
    ///
    /// Loading marks the stage busy and drives its load progress field.
    pub(crate) fn ensure_loaded<S: WorkerState>(
        &mut self,
        ctx: &mut WorkerContext<S>,
    ) -> Option<&mut M> {
        let Some(wanted) = self.wanted.clone() else {
            self.loaded = None;
            return None;
        };
        let current = self.loaded.as_ref().map(|(name, _)| name.as_str());
        if current != Some(wanted.as_str()) {
            self.loaded = None;
            if self.failed.as_deref() == Some(wanted.as_str()) {
                return None;
            }
            ctx.set_busy(true);
            let progress = ctx.sheet().progress(LOAD_PROGRESS_FIELD).ok();
            if let Some(p) = &progress {
                p.set_progress(0, false);
            }
            tracing::info!("{}: loading model '{}'", ctx.name(), wanted);
            match self.loader.load(&wanted) {
                Ok(model) => {
                    self.loaded = Some((wanted, model));
                    ctx.clear_error();
                    ctx.set_busy(false);
                }
                Err(e) => {
                    self.failed = Some(wanted);
                    ctx.report_error(e);
                }
            }
            if let Some(p) = &progress {
                p.set_progress(100, false);
            }
        }
        self.loaded.as_mut().map(|(_, model)| model.as_mut())
    }
}

/// Enable a number field and publish `value` clamped to its config.
pub(crate) fn publish_number(sheet: &WorkerSheet, name: &str, value: f64) -> std::result::Result<f64, StageError> {
    let field = sheet.number(name)?;
    let value = field.clamp(value);
    field.enable();
    field.set_number(value, false);
    Ok(value)
}

pub(crate) fn publish_flag(sheet: &WorkerSheet, name: &str, value: bool) -> std::result::Result<(), StageError> {
    let field = sheet.flag(name)?;
    field.enable();
    field.set_flag(value, false);
    Ok(())
}

/// Publish a selection's choices and selected index.
///
/// An index past the end of `choices` falls back to none.
pub(crate) fn publish_selection(
    sheet: &WorkerSheet,
    name: &str,
    choices: &[String],
    none_choice: Option<&str>,
    selected: Option<usize>,
) -> std::result::Result<Option<usize>, StageError> {
    let field = sheet.selection(name)?;
    field.set_choices(choices.iter().cloned(), none_choice);
    let selected = selected.filter(|&i| i < choices.len());
    field.enable();
    field.set_selected_index(selected, false)?;
    Ok(selected)
}

/// Accept a host-sent number, pushing the clamped value back if it differs.
pub(crate) fn accept_number(
    sheet: &WorkerSheet,
    change: &FieldChange,
) -> std::result::Result<Option<f64>, StageError> {
    let Some(value) = change.value().and_then(FieldValue::as_number) else {
        return Ok(None);
    };
    let field = sheet.number(&change.field)?;
    let clamped = field.clamp(value);
    if clamped != value {
        field.set_number(clamped, false);
    }
    Ok(Some(clamped))
}

pub(crate) fn accept_flag(change: &FieldChange) -> Option<bool> {
    change.value().and_then(FieldValue::as_flag)
}

/// Accept a host-sent selection by its choice name. `Some(None)` is the none choice.
pub(crate) fn accept_choice(
    sheet: &WorkerSheet,
    change: &FieldChange,
) -> std::result::Result<Option<Option<String>>, StageError> {
    let Some(index) = change.value().and_then(FieldValue::as_selection) else {
        return Ok(None);
    };
    let field = sheet.selection(&change.field)?;
    Ok(Some(index.and_then(|i| field.get_choices().get(i).cloned())))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::WorkerReply;
    use crate::config::StageTiming;
    use crate::control::{HostSheet, SheetBuilder};
    use crate::heap::WeakHeap;
    use crate::pipeline::{Connection, ReemitSignal, StageId};
    use crate::backend::StageWorker;
    use crate::state::StateDb;
    use std::time::Duration;

    pub(crate) struct Harness<W: StageWorker> {
        pub worker: W,
        pub ctx: WorkerContext<W::State>,
        pub host: HostSheet,
        pub input: Connection,
        pub output: Connection,
        pub heap: WeakHeap,
        pub reemit: ReemitSignal,
        pub replies: crossbeam_channel::Receiver<WorkerReply>,
    }

    impl<W: StageWorker> Harness<W> {
        pub(crate) fn new(kind: StageKind, worker: W) -> Self {
            let heap = WeakHeap::new(16);
            let reemit = ReemitSignal::new();
            let input = Connection::single_producer("in");
            let output = Connection::single_producer("out");
            let mut builder = SheetBuilder::new(kind.key());
            W::declare_controls(&mut builder);
            let (host, worker_sheet) = builder.build();
            let (reply_tx, replies) = crossbeam_channel::unbounded();
            let wiring = StageWiring {
                id: StageId(0),
                name: kind.key().to_string(),
                kind,
                heap: heap.clone(),
                reemit: reemit.clone(),
                inputs: if kind.is_source() { vec![] } else { vec![input.clone()] },
                output: if kind.is_sink() { None } else { Some(output.clone()) },
                db: StateDb::in_memory(),
                timing: StageTiming {
                    read_timeout: Duration::from_millis(1),
                    backpressure_depth: 0,
                    backpressure_retry: Duration::from_millis(1),
                    idle_sleep: Duration::from_millis(1),
                },
            };
            Self {
                worker,
                ctx: WorkerContext::new(wiring, worker_sheet, reply_tx),
                host,
                input,
                output,
                heap,
                reemit,
                replies,
            }
        }

        pub(crate) fn start(&mut self) {
            self.ctx.load_state();
            self.worker.on_start(&mut self.ctx).unwrap();
            self.host.process_messages();
        }

        pub(crate) fn tick(&mut self) {
            if let Err(e) = self.worker.on_tick(&mut self.ctx) {
                self.ctx.report_error(e);
            }
            self.host.process_messages();
        }

        /// Deliver a host edit to the worker the way the worker loop does.
        pub(crate) fn control(&mut self, field: &str, value: FieldValue) {
            self.host.field(field).unwrap().set_value(value, false).unwrap();
            for change in self.ctx.sheet().process_messages() {
                if change.is_actionable() {
                    if let Err(e) = self.worker.on_control(&mut self.ctx, &change) {
                        self.ctx.report_error(e);
                    }
                }
                self.ctx.sheet().confirm(&change);
            }
            self.host.process_messages();
        }

        pub(crate) fn feed(&self, env: &crate::pipeline::Envelope) {
            self.input.write(env);
        }

        pub(crate) fn take_output(&self) -> Option<crate::pipeline::Envelope> {
            let mut env = self.output.read(Duration::ZERO)?;
            env.assign_weak_heap(&self.heap);
            Some(env)
        }

        pub(crate) fn error(&self) -> Option<String> {
            self.host.error()
        }
    }
}
