//! Pipeline-wide "replay your last frame" broadcast.
//!
//! [`ReemitSignal::send`] is fire-and-forget. Each interested stage holds its
//! own [`ReemitListener`], which reports whether at least one send happened
//! since it last checked. Several sends between two checks coalesce into one
//! replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ReemitSignal {
    generation: Arc<AtomicU64>,
}

impl ReemitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self) {
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!("Reemit requested (generation {})", gen);
    }

    /// Number of sends so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// A listener that only sees sends made after this call.
    pub fn listener(&self) -> ReemitListener {
        ReemitListener {
            signal: self.clone(),
            seen: self.generation(),
        }
    }
}

#[derive(Debug)]
pub struct ReemitListener {
    signal: ReemitSignal,
    seen: u64,
}

impl ReemitListener {
    /// Consume pending sends. Returns true if there was at least one.
    pub fn recv(&mut self) -> bool {
        let current = self.signal.generation();
        if current != self.seen {
            self.seen = current;
            true
        } else {
            false
        }
    }

    /// Whether a send is pending, without consuming it.
    pub fn is_pending(&self) -> bool {
        self.signal.generation() != self.seen
    }
}
