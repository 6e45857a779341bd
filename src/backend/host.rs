//! Application-side half of a stage.

use super::lifecycle::LifecycleState;
use super::worker::{StageWorker, WorkerContext, WorkerLoop};
use super::{LifecycleError, StageWiring, WorkerCommand, WorkerReply};
use crate::control::{HostSheet, SheetBuilder};
use crate::error::Result;
use crate::pipeline::{StageId, StageKind};
use crate::state::{on_off_key, state_key, StateDb, WorkerState};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

/// Supervisor for one stage's worker thread.
///
/// The host's view of the lifecycle only advances inside
/// [`process_messages`](Self::process_messages).
pub struct StageHost {
    id: StageId,
    name: String,
    kind: StageKind,
    state: LifecycleState,
    busy: bool,
    cmd_tx: Sender<WorkerCommand>,
    reply_rx: Receiver<WorkerReply>,
    sheet: HostSheet,
    db: StateDb,
    thread: Option<JoinHandle<()>>,
    worker_gone: bool,
}

impl StageHost {
    /// Declare `W`'s controls, claim the output connection and spawn the worker thread.
    pub fn spawn<W: StageWorker>(wiring: StageWiring, worker: W) -> Result<Self> {
        let mut builder = SheetBuilder::new(wiring.name.clone());
        W::declare_controls(&mut builder);
        let (host_sheet, worker_sheet) = builder.build();

        if let Some(output) = &wiring.output {
            output.claim_writer(&wiring.name)?;
        }

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();

        let id = wiring.id;
        let name = wiring.name.clone();
        let kind = wiring.kind;
        let db = wiring.db.clone();

        let ctx = WorkerContext::<W::State>::new(wiring, worker_sheet, reply_tx.clone());
        let worker_loop = WorkerLoop::new(worker, ctx, cmd_rx, reply_tx);

        let thread = std::thread::Builder::new()
            .name(format!("stage-{}", name))
            .spawn(move || worker_loop.run())
            .map_err(|e| LifecycleError::Spawn {
                stage: name.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Spawned stage '{}' ({})", name, kind);

        Ok(Self {
            id,
            name,
            kind,
            state: LifecycleState::Stopped,
            busy: false,
            cmd_tx,
            reply_rx,
            sheet: host_sheet,
            db,
            thread: Some(thread),
            worker_gone: false,
        })
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.state
    }

    /// The UI-facing control sheet.
    pub fn sheet(&self) -> &HostSheet {
        &self.sheet
    }

    fn send(&mut self, cmd: WorkerCommand) -> std::result::Result<(), LifecycleError> {
        if self.worker_gone || self.cmd_tx.send(cmd).is_err() {
            self.worker_gone = true;
            self.state = LifecycleState::Stopped;
            return Err(LifecycleError::WorkerGone(self.name.clone()));
        }
        Ok(())
    }

    /// Begin starting. Only valid while stopped.
    pub fn start(&mut self) -> std::result::Result<(), LifecycleError> {
        let next = self.state.request_start(&self.name)?;
        self.send(WorkerCommand::Start)?;
        tracing::info!("Starting stage '{}'", self.name);
        self.state = next;
        Ok(())
    }

    /// Begin stopping. A no-op when already stopped or stopping.
    pub fn stop(&mut self) -> std::result::Result<(), LifecycleError> {
        let Some(next) = self.state.request_stop() else {
            return Ok(());
        };
        self.send(WorkerCommand::Stop)?;
        tracing::info!("Stopping stage '{}'", self.name);
        self.state = next;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state == LifecycleState::Started
    }

    pub fn is_starting(&self) -> bool {
        self.state == LifecycleState::Starting
    }

    pub fn is_stopped(&self) -> bool {
        self.state == LifecycleState::Stopped
    }

    pub fn is_stopping(&self) -> bool {
        self.state == LifecycleState::Stopping
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Current text of the stage's error field.
    pub fn last_error(&self) -> Option<String> {
        self.sheet.error()
    }

    /// Drain worker replies and apply pending control sheet updates.
    pub fn process_messages(&mut self) {
        loop {
            match self.reply_rx.try_recv() {
                Ok(reply) => self.handle_reply(reply),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.worker_gone {
                        tracing::warn!("Worker thread of stage '{}' disconnected", self.name);
                        self.worker_gone = true;
                    }
                    self.state = LifecycleState::Stopped;
                    self.busy = false;
                    break;
                }
            }
        }
        self.sheet.process_messages();
    }

    fn handle_reply(&mut self, reply: WorkerReply) {
        match reply {
            WorkerReply::Started => self.state = self.state.on_started(),
            WorkerReply::StartFailed(reason) => {
                tracing::warn!("Stage '{}' failed to start: {}", self.name, reason);
                self.state = self.state.on_start_failed();
            }
            WorkerReply::Stopped => {
                self.state = self.state.on_stopped();
                self.busy = false;
            }
            WorkerReply::Busy(busy) => self.busy = busy,
            WorkerReply::Exited => {
                self.worker_gone = true;
                self.state = LifecycleState::Stopped;
                self.busy = false;
            }
        }
    }

    /// Start the stage if it should be on.
    ///
    /// A persisted flag is used when the stage kind remembers its on state;
    /// otherwise `default` decides.
    pub fn restore_on_off_state(
        &mut self,
        default: bool,
    ) -> std::result::Result<(), LifecycleError> {
        let persisted = self.db.get::<bool>(&on_off_key(&self.name));
        let on = match persisted {
            Some(on) if self.kind.remembers_on_state() => on,
            _ => default,
        };
        tracing::debug!(
            "Restoring stage '{}' as {} (persisted {:?})",
            self.name,
            if on { "on" } else { "off" },
            persisted
        );
        if on && self.is_stopped() {
            self.start()?;
        }
        Ok(())
    }

    /// Persist whether the stage is currently on.
    pub fn save_on_off_state(&self) {
        let on = self.is_started() || self.is_starting();
        if let Err(e) = self.db.set(&on_off_key(&self.name), &on) {
            tracing::warn!("Failed to save on/off state of '{}': {}", self.name, e);
        }
    }

    /// The stage's persisted worker state, or its default.
    pub fn get_state<S: WorkerState>(&self) -> S {
        self.db.get(&state_key(&self.name)).unwrap_or_default()
    }
}

impl Drop for StageHost {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Exit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker thread of stage '{}' panicked", self.name);
            }
        }
    }
}

impl std::fmt::Debug for StageHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHost")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("busy", &self.busy)
            .finish()
    }
}
