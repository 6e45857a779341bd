//! Per-frame unit travelling through connections.
//!
//! An [`Envelope`] carries frame metadata, an ordered list of
//! [`FaceRecord`]s and named handles into the shared [`WeakHeap`]. Pixels are
//! never copied between stages; only handles move.
//!
//! Handle resolution requires an explicit bind step
//! ([`Envelope::assign_weak_heap`]). Envelopes read from a connection arrive
//! unbound so that the consumer decides which heap resolves them.

use crate::heap::{HeapHandle, WeakHeap};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::types::{FaceRecord, FrameSize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ENVELOPE_UID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique, monotonically increasing envelope uid.
pub fn next_envelope_uid() -> u64 {
    NEXT_ENVELOPE_UID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Envelope {
    uid: u64,
    pub frame_num: u64,
    pub frame_timestamp: f64,
    pub frame_size: Option<FrameSize>,
    named_images: BTreeMap<String, HeapHandle>,
    pub face_records: Vec<FaceRecord>,
    #[serde(skip)]
    heap: Option<WeakHeap>,
}

impl Envelope {
    pub fn new(frame_num: u64, frame_timestamp: f64) -> Self {
        Self {
            uid: next_envelope_uid(),
            frame_num,
            frame_timestamp,
            frame_size: None,
            named_images: BTreeMap::new(),
            face_records: Vec::new(),
            heap: None,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Bind this envelope to `heap` for handle resolution.
    pub fn assign_weak_heap(&mut self, heap: &WeakHeap) {
        self.heap = Some(heap.clone());
    }

    pub fn is_bound(&self) -> bool {
        self.heap.is_some()
    }

    fn bound_heap(&self) -> PipelineResult<&WeakHeap> {
        self.heap.as_ref().ok_or(PipelineError::HeapNotAssigned)
    }

    /// Store `bytes` in the bound heap under `name`, replacing any previous key.
    pub fn set_image(
        &mut self,
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> PipelineResult<HeapHandle> {
        let handle = self.bound_heap()?.add(bytes);
        self.named_images.insert(name.into(), handle);
        Ok(handle)
    }

    /// Point `name` at an existing handle (e.g. forwarding an upstream image).
    pub fn set_image_handle(&mut self, name: impl Into<String>, handle: HeapHandle) {
        self.named_images.insert(name.into(), handle);
    }

    /// Resolve the image stored under `name`.
    ///
    /// `Ok(None)` means the key was never set or the buffer was evicted;
    /// both are "feature unavailable". An unbound envelope is a usage error.
    pub fn get_image(&self, name: &str) -> PipelineResult<Option<Arc<[u8]>>> {
        let heap = self.bound_heap()?;
        Ok(self.named_images.get(name).and_then(|h| heap.get(*h)))
    }

    pub fn image_handle(&self, name: &str) -> Option<HeapHandle> {
        self.named_images.get(name).copied()
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.named_images.contains_key(name)
    }

    pub fn remove_image(&mut self, name: &str) -> Option<HeapHandle> {
        self.named_images.remove(name)
    }

    pub fn image_names(&self) -> impl Iterator<Item = &str> {
        self.named_images.keys().map(String::as_str)
    }

    /// Copy without the heap binding, as written to a connection.
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.heap = None;
        copy
    }

    /// Same content under a fresh uid, for replaying a frame.
    pub fn replay(&self) -> Self {
        let mut copy = self.clone();
        copy.uid = next_envelope_uid();
        copy
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("uid", &self.uid)
            .field("frame_num", &self.frame_num)
            .field("frame_timestamp", &self.frame_timestamp)
            .field("frame_size", &self.frame_size)
            .field("named_images", &self.named_images)
            .field("faces", &self.face_records.len())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uids_increase() {
        let a = Envelope::new(0, 0.0);
        let b = Envelope::new(0, 0.0);
        assert!(b.uid() > a.uid());
        assert!(a.replay().uid() > b.uid());
    }

    #[test]
    fn test_unbound_access_fails_fast() {
        let mut env = Envelope::new(1, 0.0);
        assert!(matches!(
            env.set_image("frame", vec![1u8]),
            Err(PipelineError::HeapNotAssigned)
        ));
        assert!(matches!(
            env.get_image("frame"),
            Err(PipelineError::HeapNotAssigned)
        ));
    }

    #[test]
    fn test_missing_key_is_absent_not_error() {
        let heap = WeakHeap::new(1);
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&heap);
        assert!(env.get_image("face0_align").unwrap().is_none());
    }

    #[test]
    fn test_set_and_get_image() {
        let heap = WeakHeap::new(1);
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&heap);
        env.set_image("frame", vec![1u8, 2, 3]).unwrap();
        assert_eq!(env.get_image("frame").unwrap().as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(env.image_names().collect::<Vec<_>>(), vec!["frame"]);
    }

    #[test]
    fn test_detached_drops_binding_keeps_handles() {
        let heap = WeakHeap::new(1);
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&heap);
        let h = env.set_image("frame", vec![9u8; 4]).unwrap();

        let mut wire = env.detached();
        assert!(!wire.is_bound());
        assert_eq!(wire.image_handle("frame"), Some(h));
        assert_eq!(wire.uid(), env.uid());

        wire.assign_weak_heap(&heap);
        assert!(wire.get_image("frame").unwrap().is_some());
    }

    #[test]
    fn test_evicted_image_resolves_absent() {
        let heap = WeakHeap::with_capacity_bytes(8);
        let mut env = Envelope::new(1, 0.0);
        env.assign_weak_heap(&heap);
        env.set_image("frame", vec![0u8; 8]).unwrap();
        heap.add(vec![1u8; 8]);
        assert!(env.has_image("frame"));
        assert!(env.get_image("frame").unwrap().is_none());
    }
}
