//! Versioned latest-value channel between stages.
//!
//! A [`Connection`] holds at most one envelope: the most recent write. A slow
//! consumer skips intermediate frames instead of queueing them. Every write
//! bumps a write id; every successful read records the write id it observed,
//! so `write_id - read_id` is the number of writes the consumer has not seen.
//! Producers gate on [`Connection::is_full_read`] to bound that number.
//!
//! `read` is the only blocking call and always takes a timeout, so a stage
//! loop never waits indefinitely.

use crate::pipeline::envelope::Envelope;
use crate::pipeline::error::{PipelineError, PipelineResult};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Who may write to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Exactly one upstream stage writes.
    #[default]
    SingleProducer,
    /// Several upstream stages may write; last write wins.
    MultiProducer,
}

/// Counters describing a connection's traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub write_id: u64,
    pub read_id: u64,
    /// Writes that replaced an envelope nobody had read.
    pub overwritten: u64,
}

impl ConnectionStats {
    pub fn unread(&self) -> u64 {
        self.write_id - self.read_id
    }
}

struct ConnectionState {
    latest: Option<Envelope>,
    write_id: u64,
    read_id: u64,
    overwritten: u64,
    writers: Vec<String>,
}

struct ConnectionInner {
    name: String,
    mode: ConnectionMode,
    state: Mutex<ConnectionState>,
    written: Condvar,
}

/// Cloneable handle to one connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(name: impl Into<String>, mode: ConnectionMode) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                name: name.into(),
                mode,
                state: Mutex::new(ConnectionState {
                    latest: None,
                    write_id: 0,
                    read_id: 0,
                    overwritten: 0,
                    writers: Vec::new(),
                }),
                written: Condvar::new(),
            }),
        }
    }

    pub fn single_producer(name: impl Into<String>) -> Self {
        Self::new(name, ConnectionMode::SingleProducer)
    }

    pub fn multi_producer(name: impl Into<String>) -> Self {
        Self::new(name, ConnectionMode::MultiProducer)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner.mode
    }

    /// Register `owner` as a producer. A single-producer connection accepts one.
    pub fn claim_writer(&self, owner: &str) -> PipelineResult<()> {
        let mut state = self.lock();
        if state.writers.iter().any(|w| w == owner) {
            return Ok(());
        }
        if self.inner.mode == ConnectionMode::SingleProducer {
            if let Some(existing) = state.writers.first() {
                return Err(PipelineError::DuplicateProducer {
                    connection: self.inner.name.clone(),
                    existing: existing.clone(),
                    requested: owner.to_string(),
                });
            }
        }
        state.writers.push(owner.to_string());
        Ok(())
    }

    pub fn writers(&self) -> Vec<String> {
        self.lock().writers.clone()
    }

    /// Publish `envelope` as the latest value. Never blocks.
    ///
    /// The heap binding is stripped; consumers bind their own.
    pub fn write(&self, envelope: &Envelope) {
        let wire = envelope.detached();
        let mut state = self.lock();
        if state.write_id > state.read_id && state.latest.is_some() {
            state.overwritten += 1;
            tracing::trace!(
                "Connection '{}' overwrote unread envelope (write_id {})",
                self.inner.name,
                state.write_id
            );
        }
        state.latest = Some(wire);
        state.write_id += 1;
        drop(state);
        self.inner.written.notify_all();
    }

    /// Wait up to `timeout` for an unread write and return it.
    ///
    /// Returns `None` if nothing new was written in time. A zero timeout polls.
    pub fn read(&self, timeout: Duration) -> Option<Envelope> {
        let state = self.lock();
        let (mut state, _) = self
            .inner
            .written
            .wait_timeout_while(state, timeout, |s| s.write_id == s.read_id)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.write_id == state.read_id {
            return None;
        }
        state.read_id = state.write_id;
        state.latest.clone()
    }

    /// Number of writes so far.
    pub fn get_write_id(&self) -> u64 {
        self.lock().write_id
    }

    /// The envelope produced by write `id`, if it is still the latest.
    ///
    /// Earlier writes are never observable. Does not mark anything read.
    pub fn get_by_id(&self, id: u64) -> Option<Envelope> {
        let state = self.lock();
        if id != 0 && id == state.write_id {
            state.latest.clone()
        } else {
            None
        }
    }

    /// Whether at least `n` writes are still unread. `n == 0` disables gating.
    pub fn is_full_read(&self, n: u64) -> bool {
        if n == 0 {
            return false;
        }
        let state = self.lock();
        state.write_id - state.read_id >= n
    }

    /// Whether an unread write is waiting.
    pub fn has_data(&self) -> bool {
        let state = self.lock();
        state.write_id > state.read_id
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.lock();
        ConnectionStats {
            write_id: state.write_id,
            read_id: state.read_id,
            overwritten: state.overwritten,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("write_id", &stats.write_id)
            .field("read_id", &stats.read_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn env(frame: u64) -> Envelope {
        Envelope::new(frame, frame as f64)
    }

    #[test]
    fn test_read_empty_times_out() {
        let conn = Connection::single_producer("c");
        let start = Instant::now();
        assert!(conn.read(Duration::from_millis(10)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_latest_write_wins() {
        let conn = Connection::single_producer("c");
        for i in 1..=3 {
            conn.write(&env(i));
        }
        let got = conn.read(Duration::ZERO).unwrap();
        assert_eq!(got.frame_num, 3);
        assert!(conn.read(Duration::ZERO).is_none());
        assert_eq!(conn.stats().overwritten, 2);
    }

    #[test]
    fn test_backpressure_query() {
        let conn = Connection::single_producer("c");
        assert!(!conn.is_full_read(1));
        conn.write(&env(1));
        assert!(conn.is_full_read(1));
        assert!(!conn.is_full_read(2));
        assert!(!conn.is_full_read(0));
        conn.read(Duration::ZERO);
        assert!(!conn.is_full_read(1));
        assert!(!conn.has_data());
    }

    #[test]
    fn test_get_by_id_only_latest() {
        let conn = Connection::single_producer("c");
        assert!(conn.get_by_id(0).is_none());
        conn.write(&env(1));
        let first = conn.get_write_id();
        conn.write(&env(2));
        assert!(conn.get_by_id(first).is_none());
        assert_eq!(conn.get_by_id(conn.get_write_id()).unwrap().frame_num, 2);
        // Peeking leaves the write unread.
        assert!(conn.has_data());
    }

    #[test]
    fn test_read_wakes_on_write() {
        let conn = Connection::single_producer("c");
        let writer = conn.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.write(&env(7));
        });
        let got = conn.read(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got.map(|e| e.frame_num), Some(7));
    }

    #[test]
    fn test_written_envelope_is_unbound() {
        let heap = crate::heap::WeakHeap::new(1);
        let mut e = env(1);
        e.assign_weak_heap(&heap);
        let conn = Connection::single_producer("c");
        conn.write(&e);
        assert!(!conn.read(Duration::ZERO).unwrap().is_bound());
    }

    #[test]
    fn test_claim_writer() {
        let single = Connection::single_producer("s");
        single.claim_writer("camera").unwrap();
        single.claim_writer("camera").unwrap();
        assert!(matches!(
            single.claim_writer("file"),
            Err(PipelineError::DuplicateProducer { .. })
        ));

        let multi = Connection::multi_producer("m");
        multi.claim_writer("camera").unwrap();
        multi.claim_writer("file").unwrap();
        assert_eq!(multi.writers(), vec!["camera", "file"]);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_reads_see_latest_and_count_unread(
            ops in prop::collection::vec(any::<bool>(), 1..64),
            depth in 0u64..4
        ) {
            let conn = Connection::single_producer("c");
            let mut written = 0u64;
            let mut unread = 0u64;
            for (i, is_write) in ops.into_iter().enumerate() {
                if is_write {
                    conn.write(&env(i as u64));
                    written = i as u64;
                    unread += 1;
                } else {
                    let got = conn.read(Duration::ZERO);
                    if unread == 0 {
                        prop_assert!(got.is_none());
                    } else {
                        prop_assert_eq!(got.map(|e| e.frame_num), Some(written));
                    }
                    unread = 0;
                }
                prop_assert_eq!(conn.stats().unread(), unread);
                prop_assert_eq!(conn.has_data(), unread > 0);
                prop_assert_eq!(conn.is_full_read(depth), depth > 0 && unread >= depth);
            }
        }
    }
}
