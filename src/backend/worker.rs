//! Stage worker trait and the worker thread loop
//!
//! A stage implements [`StageWorker`]; the loop in [`WorkerLoop::run`] owns
//! it on a dedicated thread and calls its hooks.
//!
//! # Loop
//!
//! Each iteration:
//!
//! 1. Drains [`WorkerCommand`]s and answers with [`WorkerReply`]s
//! 2. Applies control sheet updates from the host and, while started, hands
//!    each actionable one to [`StageWorker::on_control`]
//! 3. While started, calls [`StageWorker::on_tick`]; otherwise sleeps
//!    `idle_sleep`
//!
//! Hook errors never leave the loop. They land in the stage's `error`
//! control field via [`WorkerContext::report_error`], and the stage keeps
//! ticking.

use super::{StageError, StageWiring, WorkerCommand, WorkerReply};
use crate::config::StageTiming;
use crate::control::{FieldChange, SheetBuilder, WorkerSheet};
use crate::heap::WeakHeap;
use crate::pipeline::{Connection, Envelope, ReemitSignal, StageKind};
use crate::state::{state_key, StateDb, WorkerState};
use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Behaviour of one pipeline stage, run on its own thread.
///
/// Hooks must not block unboundedly: `stop()` is only observed between
/// ticks. Use [`WorkerContext::read_input`] (bounded by the read timeout)
/// as the waiting point.
pub trait StageWorker: Send + 'static {
    /// Persisted attribute struct, loaded before `on_start`.
    type State: WorkerState;

    /// Declare the stage's control fields.
    fn declare_controls(builder: &mut SheetBuilder)
    where
        Self: Sized;

    /// Acquire resources and publish initial control values.
    fn on_start(&mut self, ctx: &mut WorkerContext<Self::State>) -> Result<(), StageError>;

    /// One bounded unit of work.
    fn on_tick(&mut self, ctx: &mut WorkerContext<Self::State>) -> Result<(), StageError>;

    /// Release resources (devices, models, files).
    fn on_stop(&mut self, _ctx: &mut WorkerContext<Self::State>) {}

    /// A host-originated control change.
    fn on_control(
        &mut self,
        _ctx: &mut WorkerContext<Self::State>,
        _change: &FieldChange,
    ) -> Result<(), StageError> {
        Ok(())
    }
}

/// Worker-side view of a stage's wiring, controls and state.
pub struct WorkerContext<S: WorkerState> {
    name: String,
    kind: StageKind,
    heap: WeakHeap,
    reemit: ReemitSignal,
    inputs: Vec<Connection>,
    output: Option<Connection>,
    sheet: WorkerSheet,
    state: S,
    db: StateDb,
    reply_tx: Sender<WorkerReply>,
    timing: StageTiming,
    pending: Option<Envelope>,
    busy: bool,
}

impl<S: WorkerState> WorkerContext<S> {
    pub(crate) fn new(
        wiring: StageWiring,
        sheet: WorkerSheet,
        reply_tx: Sender<WorkerReply>,
    ) -> Self {
        let StageWiring {
            name,
            kind,
            heap,
            reemit,
            inputs,
            output,
            db,
            timing,
            ..
        } = wiring;
        Self {
            name,
            kind,
            heap,
            reemit,
            inputs,
            output,
            sheet,
            state: S::default(),
            db,
            reply_tx,
            timing,
            pending: None,
            busy: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn heap(&self) -> &WeakHeap {
        &self.heap
    }

    pub fn sheet(&self) -> &WorkerSheet {
        &self.sheet
    }

    pub fn timing(&self) -> StageTiming {
        self.timing
    }

    pub fn reemit_signal(&self) -> &ReemitSignal {
        &self.reemit
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn input(&self, idx: usize) -> Option<&Connection> {
        self.inputs.get(idx)
    }

    pub fn output(&self) -> Option<&Connection> {
        self.output.as_ref()
    }

    /// A fresh envelope already bound to this stage's heap.
    pub fn new_envelope(&self, frame_num: u64, frame_timestamp: f64) -> Envelope {
        let mut env = Envelope::new(frame_num, frame_timestamp);
        env.assign_weak_heap(&self.heap);
        env
    }

    /// Read input `idx`, waiting at most the read timeout. The result is bound.
    pub fn read_input(&self, idx: usize) -> Option<Envelope> {
        let mut env = self.inputs.get(idx)?.read(self.timing.read_timeout)?;
        env.assign_weak_heap(&self.heap);
        Some(env)
    }

    /// Queue `envelope` for the output and try to write it.
    ///
    /// A newer emit replaces an older one still held back by backpressure.
    pub fn emit(&mut self, envelope: Envelope) -> bool {
        if self.pending.replace(envelope).is_some() {
            tracing::trace!("{}: replaced deferred envelope", self.name);
        }
        self.flush_output()
    }

    /// Write the deferred envelope if the output has room.
    ///
    /// Returns true when nothing is left pending. When the output is full
    /// this sleeps one retry interval and returns false.
    pub fn flush_output(&mut self) -> bool {
        let Some(env) = self.pending.as_ref() else {
            return true;
        };
        let Some(output) = self.output.as_ref() else {
            self.pending = None;
            return true;
        };
        if output.is_full_read(self.timing.backpressure_depth) {
            std::thread::sleep(self.timing.backpressure_retry);
            return false;
        }
        output.write(env);
        self.pending = None;
        true
    }

    pub fn has_pending_output(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn drop_pending_output(&mut self) {
        self.pending = None;
    }

    /// Load persisted state into the context (defaults when absent).
    pub fn load_state(&mut self) {
        self.state = self.db.get(&state_key(&self.name)).unwrap_or_default();
    }

    /// Persist the current state. Failures are logged only.
    pub fn save_state(&self) {
        if let Err(e) = self.db.set(&state_key(&self.name), &self.state) {
            tracing::warn!("{}: failed to save state: {}", self.name, e);
        }
    }

    /// Ask the sources to replay their last frame.
    pub fn reemit_frame(&self) {
        self.reemit.send();
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn set_busy(&mut self, busy: bool) {
        if self.busy != busy {
            self.busy = busy;
            let _ = self.reply_tx.send(WorkerReply::Busy(busy));
        }
    }

    /// Show `err` on the stage's error field and clear busy.
    pub fn report_error(&mut self, err: impl std::fmt::Display) {
        let msg = err.to_string();
        tracing::error!("{}: {}", self.name, msg);
        self.sheet.error_field().set_text(msg, false);
        self.set_busy(false);
    }

    pub fn clear_error(&self) {
        let field = self.sheet.error_field();
        if !field.get_text().is_empty() {
            field.set_text("", false);
        }
    }
}

/// Owns a worker and its context on the worker thread.
pub(crate) struct WorkerLoop<W: StageWorker> {
    worker: W,
    ctx: WorkerContext<W::State>,
    cmd_rx: Receiver<WorkerCommand>,
    reply_tx: Sender<WorkerReply>,
    started: bool,
}

impl<W: StageWorker> WorkerLoop<W> {
    pub(crate) fn new(
        worker: W,
        ctx: WorkerContext<W::State>,
        cmd_rx: Receiver<WorkerCommand>,
        reply_tx: Sender<WorkerReply>,
    ) -> Self {
        Self {
            worker,
            ctx,
            cmd_rx,
            reply_tx,
            started: false,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("{}: worker thread running", self.ctx.name);

        loop {
            if !self.process_commands() {
                break;
            }
            self.process_controls();

            if self.started {
                if let Err(e) = self.worker.on_tick(&mut self.ctx) {
                    self.ctx.report_error(e);
                }
            } else {
                std::thread::sleep(self.ctx.timing.idle_sleep);
            }
        }

        let _ = self.reply_tx.send(WorkerReply::Exited);
        tracing::debug!("{}: worker thread exited", self.ctx.name);
    }

    /// Returns false when the loop should exit.
    fn process_commands(&mut self) -> bool {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(WorkerCommand::Start) => self.handle_start(),
                Ok(WorkerCommand::Stop) => {
                    self.handle_stop();
                    let _ = self.reply_tx.send(WorkerReply::Stopped);
                }
                Ok(WorkerCommand::Exit) | Err(TryRecvError::Disconnected) => {
                    self.handle_stop();
                    return false;
                }
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn handle_start(&mut self) {
        if self.started {
            let _ = self.reply_tx.send(WorkerReply::Started);
            return;
        }
        self.ctx.load_state();
        self.ctx.clear_error();
        match self.worker.on_start(&mut self.ctx) {
            Ok(()) => {
                self.started = true;
                tracing::info!("{}: started", self.ctx.name);
                let _ = self.reply_tx.send(WorkerReply::Started);
            }
            Err(e) => {
                let msg = e.to_string();
                self.ctx.report_error(e);
                self.worker.on_stop(&mut self.ctx);
                self.ctx.sheet.disable_all();
                let _ = self.reply_tx.send(WorkerReply::StartFailed(msg));
            }
        }
    }

    fn handle_stop(&mut self) {
        if !self.started {
            return;
        }
        self.worker.on_stop(&mut self.ctx);
        self.ctx.drop_pending_output();
        self.ctx.sheet.disable_all();
        self.ctx.set_busy(false);
        self.started = false;
        tracing::info!("{}: stopped", self.ctx.name);
    }

    fn process_controls(&mut self) {
        let changes = self.ctx.sheet.process_messages();
        for change in changes {
            if self.started && change.is_actionable() {
                if let Err(e) = self.worker.on_control(&mut self.ctx, &change) {
                    self.ctx.report_error(e);
                }
            }
            self.ctx.sheet.confirm(&change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{FieldValue, NumberConfig};
    use crate::pipeline::StageId;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct CounterState {
        step: Option<f64>,
    }

    fn wiring(output: Option<Connection>) -> StageWiring {
        StageWiring {
            id: StageId(0),
            name: "counter".into(),
            kind: StageKind::FaceDetector,
            heap: WeakHeap::new(1),
            reemit: ReemitSignal::new(),
            inputs: vec![],
            output,
            db: StateDb::in_memory(),
            timing: StageTiming {
                backpressure_retry: std::time::Duration::from_millis(1),
                ..StageTiming::default()
            },
        }
    }

    fn context(output: Option<Connection>) -> WorkerContext<CounterState> {
        let mut b = SheetBuilder::new("counter");
        b.number("step", NumberConfig::int(1, 10));
        let (_host, worker_sheet) = b.build();
        let (reply_tx, _reply_rx) = crossbeam_channel::unbounded();
        WorkerContext::new(wiring(output), worker_sheet, reply_tx)
    }

    #[test]
    fn test_emit_respects_backpressure() {
        let out = Connection::single_producer("out");
        let mut ctx = context(Some(out.clone()));

        assert!(ctx.emit(ctx.new_envelope(1, 0.0)));
        assert!(!ctx.emit(ctx.new_envelope(2, 0.0)));
        assert!(ctx.has_pending_output());
        assert_eq!(out.get_write_id(), 1);

        assert_eq!(out.read(std::time::Duration::ZERO).unwrap().frame_num, 1);
        assert!(ctx.flush_output());
        assert_eq!(out.read(std::time::Duration::ZERO).unwrap().frame_num, 2);
    }

    #[test]
    fn test_backpressured_emit_waits_one_retry_interval() {
        let out = Connection::single_producer("out");
        let mut ctx = context(Some(out.clone()));
        let retry = ctx.timing().backpressure_retry;
        assert!(ctx.emit(ctx.new_envelope(1, 0.0)));

        for n in 2..=4 {
            let started = std::time::Instant::now();
            assert!(!ctx.emit(ctx.new_envelope(n, 0.0)));
            let waited = started.elapsed();
            assert!(waited >= retry);
            assert!(waited < retry * 50, "emit blocked for {:?}", waited);
        }

        // Only the newest deferred frame goes out once there is room.
        assert_eq!(out.read(std::time::Duration::ZERO).unwrap().frame_num, 1);
        assert!(ctx.flush_output());
        assert_eq!(out.read(std::time::Duration::ZERO).unwrap().frame_num, 4);
    }

    #[test]
    fn test_emit_without_output_discards() {
        let mut ctx = context(None);
        assert!(ctx.emit(ctx.new_envelope(1, 0.0)));
        assert!(!ctx.has_pending_output());
    }

    #[test]
    fn test_state_save_and_load() {
        let mut ctx = context(None);
        ctx.state_mut().step = Some(3.0);
        ctx.save_state();
        ctx.state_mut().step = None;
        ctx.load_state();
        assert_eq!(ctx.state().step, Some(3.0));
    }

    #[test]
    fn test_report_error_sets_field_and_clears_busy() {
        let mut ctx = context(None);
        ctx.set_busy(true);
        ctx.report_error(StageError::collaborator("camera unplugged"));
        assert!(!ctx.is_busy());
        assert_eq!(
            ctx.sheet().error_field().value(),
            FieldValue::Text("camera unplugged".into())
        );
        ctx.clear_error();
        assert_eq!(ctx.sheet().error_field().get_text(), "");
    }
}
