use serde::{Deserialize, Serialize};

/// One decoded storage sample: timestamp in ms since epoch, float value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub t: i64,
    pub v: f64,
}

impl Sample {
    pub fn new(t: i64, v: f64) -> Self {
        Sample { t, v }
    }
}

/// The samples of every output series at one instant. `sample_ids` and
/// `samples` are parallel; absent series are simply omitted. A step vector
/// is owned by exactly one holder at a time: it moves from the producing
/// operator to its consumer and is returned to the producer's pool after
/// use.
#[derive(Debug, Default)]
pub struct StepVector {
    pub t: i64,
    pub sample_ids: Vec<usize>,
    pub samples: Vec<f64>,
}

impl StepVector {
    pub fn append_sample(&mut self, id: usize, v: f64) {
        self.sample_ids.push(id);
        self.samples.push(v);
    }

    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.sample_ids.iter().copied().zip(self.samples.iter().copied())
    }
}

/// A run of step vectors with strictly increasing timestamps, at most
/// `steps_batch` long. The container itself is pooled alongside its vectors.
pub type Batch = Vec<StepVector>;
