//! Test data builders for creating test objects

use facelive_rs::config::StageTiming;
use facelive_rs::heap::WeakHeap;
use facelive_rs::pipeline::{Envelope, PipelineRuntime};
use facelive_rs::state::StateDb;
use facelive_rs::types::{FaceRecord, FaceRect, FrameSize, FRAME_KEY};
use std::time::Duration;

/// Builder for bound envelopes carrying a frame image
pub struct EnvelopeBuilder {
    frame_num: u64,
    size: FrameSize,
    fill: u8,
    faces: Vec<FaceRect>,
}

impl EnvelopeBuilder {
    pub fn new(frame_num: u64) -> Self {
        Self {
            frame_num,
            size: FrameSize::new(8, 8, 1),
            fill: 0,
            faces: Vec::new(),
        }
    }

    pub fn size(mut self, size: FrameSize) -> Self {
        self.size = size;
        self
    }

    pub fn fill(mut self, fill: u8) -> Self {
        self.fill = fill;
        self
    }

    pub fn face(mut self, rect: FaceRect) -> Self {
        self.faces.push(rect);
        self
    }

    pub fn build(self, heap: &WeakHeap) -> Envelope {
        let mut env = Envelope::new(self.frame_num, self.frame_num as f64 / 30.0);
        env.assign_weak_heap(heap);
        env.frame_size = Some(self.size);
        env.set_image(FRAME_KEY, vec![self.fill; self.size.byte_len()])
            .expect("bound envelope");
        env.face_records = self.faces.into_iter().map(FaceRecord::from_rect).collect();
        env
    }
}

/// Short timeouts so threaded tests settle quickly
pub fn fast_timing() -> StageTiming {
    StageTiming {
        read_timeout: Duration::from_millis(2),
        backpressure_depth: 1,
        backpressure_retry: Duration::from_millis(1),
        idle_sleep: Duration::from_millis(2),
    }
}

/// Runtime over an in-memory state database
pub fn runtime(heap_mb: usize) -> PipelineRuntime {
    runtime_with_db(heap_mb, StateDb::in_memory())
}

pub fn runtime_with_db(heap_mb: usize, db: StateDb) -> PipelineRuntime {
    PipelineRuntime {
        heap: WeakHeap::new(heap_mb),
        db,
        timing: fast_timing(),
    }
}
