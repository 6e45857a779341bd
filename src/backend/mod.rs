//! Stage supervision: one worker thread per stage, driven by a host
//!
//! Every pipeline stage is split in two:
//!
//! - [`StageHost`] lives with the application. It owns the lifecycle state
//!   machine, the UI-facing [`HostSheet`](crate::control::HostSheet) and the
//!   command channel into the worker.
//! - A [`StageWorker`] runs on its own thread inside a [`WorkerContext`]. It
//!   reads input connections, calls its processing collaborator and emits
//!   envelopes.
//!
//! # Architecture
//!
//! The host and the worker talk only through channels:
//!
//! - [`WorkerCommand`] - host to worker (start, stop, exit)
//! - [`WorkerReply`] - worker to host (started, stopped, busy, ...)
//! - Control sheet messages in both directions
//!
//! Nothing moves unless the host is pumped with
//! [`StageHost::process_messages`]; see [`crate::pipeline::Scheduler`].
//!
//! # Example
//!
//! ```ignore
//! let mut host = StageHost::spawn(wiring, DetectorWorker::new(provider))?;
//! host.start()?;
//! while host.is_starting() {
//!     host.process_messages();
//!     std::thread::sleep(Duration::from_millis(5));
//! }
//! ```

pub mod host;
pub mod lifecycle;
pub mod worker;

pub use host::StageHost;
pub use lifecycle::LifecycleState;
pub use worker::{StageWorker, WorkerContext};

use crate::config::StageTiming;
use crate::control::ControlError;
use crate::heap::WeakHeap;
use crate::pipeline::{Connection, PipelineError, ReemitSignal, StageId, StageKind};
use crate::state::StateDb;
use thiserror::Error;

/// Commands sent from a host to its worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Start,
    Stop,
    /// Leave the thread loop (stopping first if needed)
    Exit,
}

/// Replies sent from a worker thread to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Started,
    /// `on_start` failed; the worker is stopped again
    StartFailed(String),
    Stopped,
    Busy(bool),
    Exited,
}

/// Errors raised by stage workers and their collaborators.
///
/// These never cross a connection: the worker loop turns them into the
/// stage's `error` control field.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Collaborator(String),

    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn collaborator(msg: impl Into<String>) -> Self {
        StageError::Collaborator(msg.into())
    }
}

/// Lifecycle misuse. Returned immediately, never ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Stage '{stage}' cannot {action} while {state:?}")]
    InvalidTransition {
        stage: String,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("Worker thread of stage '{0}' is gone")]
    WorkerGone(String),

    #[error("Failed to spawn worker for stage '{stage}': {reason}")]
    Spawn { stage: String, reason: String },
}

/// Everything a stage is wired to, handed over by the graph builder.
#[derive(Clone, Debug)]
pub struct StageWiring {
    pub id: StageId,
    pub name: String,
    pub kind: StageKind,
    pub heap: WeakHeap,
    pub reemit: ReemitSignal,
    pub inputs: Vec<Connection>,
    pub output: Option<Connection>,
    pub db: StateDb,
    pub timing: StageTiming,
}
