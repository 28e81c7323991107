pub mod pool;
pub mod vector;

pub use pool::VectorPool;
pub use vector::{Batch, Sample, StepVector};

use serde::{Deserialize, Serialize};

use crate::labels::Labels;

/// One series of a range-query result: a label set and its `(t, v)` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// One element of an instant-query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    pub labels: Labels,
    pub t: i64,
    pub v: f64,
}

/// Query result: a matrix for range queries, a single materialized step
/// vector for instant queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result_type", content = "result", rename_all = "lowercase")]
pub enum QueryValue {
    Matrix(Vec<TimeSeries>),
    Vector(Vec<VectorSample>),
}
