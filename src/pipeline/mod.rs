//! Stage graph, data passing and scheduling.
//!
//! Frames flow through stages connected by latest-value [`Connection`]s:
//!
//! ```text
//! [CameraSource]─┐                                      ┌─[FaceAnimator]─┐
//!                ├─► [Detector] ─► [Marker] ─► [Aligner]┤                ├─► [Adjuster] ─► [Merger] ─► [Output]
//! [FileSource]───┘                                      └─[FaceSwapper]──┘
//! ```
//!
//! # Design
//!
//! - **Latest value, not FIFO** - a slow consumer skips frames instead of
//!   falling behind; producers bound unread writes with `is_full_read`.
//! - **Handles, not pixels** - [`Envelope`]s carry [`WeakHeap`](crate::heap::WeakHeap)
//!   handles; buffers are stored once.
//! - **Graph builder** - stages are declared as `(kind, inputs, output)` and
//!   constructed in topological order.
//! - **Cooperative pump** - hosts only progress when a [`Scheduler`] polls them.
//! - **Reemit** - a [`ReemitSignal`] makes sources replay their last frame
//!   after a control change.

pub mod connection;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod graph;
pub mod id;
pub mod scheduler;
pub mod signal;
pub mod stage_kind;

pub use connection::{Connection, ConnectionMode, ConnectionStats};
pub use envelope::{next_envelope_uid, Envelope};
pub use error::{PipelineError, PipelineResult};
pub use executor::Pipeline;
pub use graph::{PipelineGraph, PipelineRuntime, StageDecl, StageFactory};
pub use id::{ConnectionId, StageId};
pub use scheduler::{IntervalTicks, ManualTicks, Pollable, Scheduler, TickSource};
pub use signal::{ReemitListener, ReemitSignal};
pub use stage_kind::StageKind;
