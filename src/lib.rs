//! # facelive-rs: Realtime Face Pipeline Core
//!
//! A frame pipeline that captures camera or file frames, runs them through a
//! chain of face detection, alignment, swap and merge stages, and hands the
//! result to an output sink. Every stage runs on its own worker thread; the
//! application drives all of them from one cooperative pump.
//!
//! ## Architecture
//!
//! - **Heap**: capacity-bounded LRU arena for frame buffers; handles resolve
//!   absent after eviction
//! - **Pipeline**: latest-value [`Connection`](pipeline::Connection)s between
//!   stages, a graph builder, the built [`Pipeline`] and its scheduler
//! - **Control**: mirrored host/worker parameter sheets
//! - **Backend**: the stage worker trait, its thread loop and the host-side
//!   lifecycle supervisor
//! - **State**: JSON-backed key-value store for per-stage settings
//! - **Stages**: concrete workers and the collaborator traits they call
//!
//! ## Configuration
//!
//! Settings and persisted stage state live in the platform data directory
//! under `dev.facelive.facelive-rs`:
//!
//! - **Linux**: `~/.local/share/dev.facelive.facelive-rs/`
//! - **macOS**: `~/Library/Application Support/dev.facelive.facelive-rs/`
//! - **Windows**: `%APPDATA%\dev.facelive.facelive-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use facelive_rs::{
//!     config::AppConfig,
//!     heap::WeakHeap,
//!     pipeline::{PipelineRuntime, Scheduler},
//!     stages::{default_graph, synthetic::PreviewHandle, Collaborators, DefaultStageFactory},
//!     state::StateDb,
//! };
//!
//! let config = AppConfig::load_or_default();
//! let runtime = PipelineRuntime {
//!     heap: WeakHeap::new(config.heap.capacity_mb),
//!     db: StateDb::open(config.state_path()?),
//!     timing: config.stages.timing(),
//! };
//! let factory = DefaultStageFactory::new(Collaborators::synthetic(PreviewHandle::new()));
//! let mut pipeline = default_graph().build(&factory, runtime)?;
//! pipeline.restore_on_off_states()?;
//!
//! let mut scheduler = Scheduler::interval(config.pump_interval());
//! // ... pump until done ...
//! pipeline.shutdown(&mut scheduler, config.shutdown_timeout())?;
//! ```

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod heap;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use backend::{StageHost, StageWorker, WorkerContext};
pub use config::AppConfig;
pub use error::{FaceliveError, Result};
pub use heap::{HeapHandle, WeakHeap};
pub use pipeline::{Connection, Envelope, Pipeline, PipelineGraph, Scheduler, StageKind};
pub use state::StateDb;
pub use types::{FaceRecord, FaceRect, FrameSize};
