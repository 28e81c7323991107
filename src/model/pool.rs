use std::sync::Mutex;

use super::vector::{Batch, StepVector};

// Free lists are capped so an operator that briefly balloons does not pin
// that memory for the rest of the query.
const MAX_RETAINED: usize = 64;

/// Recycler for step vectors and batch containers. Every operator owns one
/// pool for its output; consumers return what they pulled once they are done
/// with it, so steady-state allocation is proportional to pipeline width
/// rather than query span. Producers and consumers may run on different
/// workers, hence the lock.
#[derive(Debug)]
pub struct VectorPool {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    vectors: Vec<StepVector>,
    batches: Vec<Batch>,
    steps_batch: usize,
    step_size: usize,
}

impl VectorPool {
    pub fn new(steps_batch: usize) -> Self {
        VectorPool {
            inner: Mutex::new(Inner {
                vectors: Vec::new(),
                batches: Vec::new(),
                steps_batch,
                step_size: 0,
            }),
        }
    }

    /// Per-step preallocation hint, normally the operator's output series
    /// count. Only called during operator initialization.
    pub fn set_step_size(&self, n: usize) {
        self.inner.lock().unwrap().step_size = n;
    }

    /// An empty batch container with capacity for a full run of steps.
    pub fn get_vector_batch(&self) -> Batch {
        let mut inner = self.inner.lock().unwrap();
        match inner.batches.pop() {
            Some(b) => b,
            None => Vec::with_capacity(inner.steps_batch),
        }
    }

    /// An empty step vector for timestamp `t`.
    pub fn get_step_vector(&self, t: i64) -> StepVector {
        let mut inner = self.inner.lock().unwrap();
        let mut v = match inner.vectors.pop() {
            Some(v) => v,
            None => StepVector {
                t: 0,
                sample_ids: Vec::with_capacity(inner.step_size),
                samples: Vec::with_capacity(inner.step_size),
            },
        };
        v.t = t;
        v
    }

    pub fn put_step_vector(&self, mut v: StepVector) {
        v.sample_ids.clear();
        v.samples.clear();
        let mut inner = self.inner.lock().unwrap();
        if inner.vectors.len() < MAX_RETAINED {
            inner.vectors.push(v);
        }
    }

    /// Return a whole batch: each vector is scrubbed and recycled, then the
    /// emptied container itself.
    pub fn put_vectors(&self, mut batch: Batch) {
        let mut inner = self.inner.lock().unwrap();
        for mut v in batch.drain(..) {
            v.sample_ids.clear();
            v.samples.clear();
            if inner.vectors.len() < MAX_RETAINED {
                inner.vectors.push(v);
            }
        }
        if inner.batches.len() < MAX_RETAINED {
            inner.batches.push(batch);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════
