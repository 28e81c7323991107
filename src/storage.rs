use std::sync::Arc;

use promql_parser::label::{MatchOp, Matcher};

use crate::error::EngineError;
use crate::labels::Labels;
use crate::model::Sample;

/// Owning iterator over decoded samples, ordered by timestamp.
pub trait SampleIter: Iterator<Item = Sample> + Send {}

impl<T: Iterator<Item = Sample> + Send> SampleIter for T {}

/// One series handed out by the storage adaptor. `sample_iter` performs the
/// chunk decoding for `[mint, maxt]`; selectors pull from it incrementally
/// so decoding amortizes across steps.
pub trait StorageSeries: Send + Sync {
    fn labels(&self) -> &Labels;
    fn sample_iter(&self, mint: i64, maxt: i64) -> Box<dyn SampleIter>;
}

/// Storage adaptor consumed by the selector operators: series discovery by
/// label matchers over a time range. Selection order must be deterministic
/// for a given storage state.
pub trait SeriesStorage: Send + Sync {
    fn select(
        &self,
        matchers: &[Matcher],
        mint: i64,
        maxt: i64,
    ) -> Result<Vec<Arc<dyn StorageSeries>>, EngineError>;
}

// ═══════════════════════════════════════════════════════════════════
// In-memory storage
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct MemorySeries {
    labels: Labels,
    samples: Arc<Vec<Sample>>,
}

impl StorageSeries for MemorySeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn sample_iter(&self, mint: i64, maxt: i64) -> Box<dyn SampleIter> {
        Box::new(MemorySampleIter {
            samples: Arc::clone(&self.samples),
            idx: self.samples.partition_point(|s| s.t < mint),
            maxt,
        })
    }
}

struct MemorySampleIter {
    samples: Arc<Vec<Sample>>,
    idx: usize,
    maxt: i64,
}

impl Iterator for MemorySampleIter {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        let s = *self.samples.get(self.idx)?;
        if s.t > self.maxt {
            return None;
        }
        self.idx += 1;
        Some(s)
    }
}

/// In-memory series store. Series are returned in insertion order, which
/// keeps plans and join outputs deterministic across runs.
#[derive(Default)]
pub struct MemoryStorage {
    series: Vec<Arc<MemorySeries>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one series. Samples must be in ascending timestamp order.
    pub fn add_series(
        &mut self,
        labels: Labels,
        samples: impl IntoIterator<Item = (i64, f64)>,
    ) -> &mut Self {
        let samples: Vec<Sample> = samples
            .into_iter()
            .map(|(t, v)| Sample::new(t, v))
            .collect();
        debug_assert!(samples.windows(2).all(|w| w[0].t < w[1].t));
        self.series.push(Arc::new(MemorySeries {
            labels,
            samples: Arc::new(samples),
        }));
        self
    }
}

impl SeriesStorage for MemoryStorage {
    fn select(
        &self,
        matchers: &[Matcher],
        _mint: i64,
        _maxt: i64,
    ) -> Result<Vec<Arc<dyn StorageSeries>>, EngineError> {
        let compiled = compile_matchers(matchers)?;
        Ok(self
            .series
            .iter()
            .filter(|s| compiled.iter().all(|m| m.matches(&s.labels)))
            .map(|s| Arc::clone(s) as Arc<dyn StorageSeries>)
            .collect())
    }
}

enum CompiledMatcher {
    Equal { name: String, value: String },
    NotEqual { name: String, value: String },
    Re { name: String, re: regex::Regex },
    NotRe { name: String, re: regex::Regex },
}

impl CompiledMatcher {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            CompiledMatcher::Equal { name, value } => {
                labels.get(name).unwrap_or("") == value
            }
            CompiledMatcher::NotEqual { name, value } => {
                labels.get(name).unwrap_or("") != value
            }
            CompiledMatcher::Re { name, re } => re.is_match(labels.get(name).unwrap_or("")),
            CompiledMatcher::NotRe { name, re } => !re.is_match(labels.get(name).unwrap_or("")),
        }
    }
}

fn compile_matchers(matchers: &[Matcher]) -> Result<Vec<CompiledMatcher>, EngineError> {
    matchers
        .iter()
        .map(|m| {
            Ok(match &m.op {
                MatchOp::Equal => CompiledMatcher::Equal {
                    name: m.name.clone(),
                    value: m.value.clone(),
                },
                MatchOp::NotEqual => CompiledMatcher::NotEqual {
                    name: m.name.clone(),
                    value: m.value.clone(),
                },
                MatchOp::Re(_) => CompiledMatcher::Re {
                    name: m.name.clone(),
                    re: anchored(&m.value)?,
                },
                MatchOp::NotRe(_) => CompiledMatcher::NotRe {
                    name: m.name.clone(),
                    re: anchored(&m.value)?,
                },
            })
        })
        .collect()
}

// Regex matchers are fully anchored, matching Prometheus semantics.
fn anchored(pattern: &str) -> Result<regex::Regex, EngineError> {
    regex::Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| EngineError::InvalidQuery(format!("invalid matcher regex: {e}")))
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(name: &str, value: &str) -> Matcher {
        Matcher {
            op: MatchOp::Equal,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn storage() -> MemoryStorage {
        let mut s = MemoryStorage::new();
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("job", "api")]),
            [(1000, 1.0), (2000, 2.0), (3000, 3.0)],
        );
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("job", "db")]),
            [(1000, 10.0)],
        );
        s.add_series(
            Labels::from_pairs([("__name__", "other"), ("job", "api")]),
            [(1000, 99.0)],
        );
        s
    }

    #[test]
    fn test_select_by_name_and_label() {
        let s = storage();
        let out = s.select(&[eq("__name__", "m"), eq("job", "api")], 0, 10_000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].labels().get("job"), Some("api"));
    }

    #[test]
    fn test_select_regex() {
        let s = storage();
        let m = Matcher {
            op: MatchOp::Re(regex::Regex::new("a.*").unwrap()),
            name: "job".to_string(),
            value: "a.*".to_string(),
        };
        let out = s.select(&[eq("__name__", "m"), m], 0, 10_000).unwrap();
        assert_eq!(out.len(), 1, "regex must be anchored: 'a.*' must not match 'db'");
    }

    #[test]
    fn test_sample_iter_respects_range() {
        let s = storage();
        let out = s.select(&[eq("job", "api"), eq("__name__", "m")], 0, 10_000).unwrap();
        let samples: Vec<Sample> = out[0].sample_iter(1500, 2500).collect();
        assert_eq!(samples, vec![Sample::new(2000, 2.0)]);
    }

    #[test]
    fn test_missing_label_matches_empty() {
        let s = storage();
        // job != "none" matches everything, absent labels compare as "".
        let m = Matcher {
            op: MatchOp::NotEqual,
            name: "region".to_string(),
            value: "eu".to_string(),
        };
        let out = s.select(&[m], 0, 10_000).unwrap();
        assert_eq!(out.len(), 3);
    }
}
