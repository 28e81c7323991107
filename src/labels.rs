use std::collections::BTreeMap;
use std::fmt;
use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;
use serde::{Deserialize, Serialize};

/// The reserved label holding the metric name. Binary operations and
/// grouping always drop it from their outputs.
pub const METRIC_NAME: &str = "__name__";

// Fixed seeds so signatures are stable across runs and across the two sides
// of a join.
const SEED: (u64, u64, u64, u64) = (
    0x7969_6c64_5f71_7565,
    0x7279_5f65_6e67_696e,
    0x6520_6c61_6265_6c73,
    0x5f73_6967_6e61_7475,
);

const SEP: u8 = 0xff;

/// An ordered, name-unique label set. Ordering is by label name, which makes
/// equality, hashing, and output rendering deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn empty() -> Self {
        Labels(BTreeMap::new())
    }

    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Labels(
            pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn builder(&self) -> LabelsBuilder {
        LabelsBuilder(self.0.clone())
    }

    /// Deterministic 64-bit hash of the full label set.
    pub fn signature(&self) -> u64 {
        let mut h = hasher();
        for (n, v) in &self.0 {
            write_pair(&mut h, n, v);
        }
        h.finish()
    }

    /// Hash of the label set excluding `names` and `__name__`. Used for
    /// `ignoring(...)` joins and `without(...)` grouping.
    pub fn hash_without(&self, names: &[String]) -> u64 {
        let mut h = hasher();
        for (n, v) in &self.0 {
            if n == METRIC_NAME || names.iter().any(|x| x == n) {
                continue;
            }
            write_pair(&mut h, n, v);
        }
        h.finish()
    }

    /// Hash of the label set restricted to `names`. An empty `names` list
    /// yields signature 0 for every series (the cross-join bucket).
    pub fn hash_for(&self, names: &[String]) -> u64 {
        if names.is_empty() {
            return 0;
        }
        let mut h = hasher();
        for (n, v) in &self.0 {
            if names.iter().any(|x| x == n) {
                write_pair(&mut h, n, v);
            }
        }
        h.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (n, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{n}={v:?}")?;
        }
        write!(f, "}}")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Labels::from_pairs(iter)
    }
}

fn hasher() -> impl Hasher {
    RandomState::with_seeds(SEED.0, SEED.1, SEED.2, SEED.3).build_hasher()
}

fn write_pair(h: &mut impl Hasher, name: &str, value: &str) {
    h.write(name.as_bytes());
    h.write_u8(SEP);
    h.write(value.as_bytes());
    h.write_u8(SEP);
}

/// Mutable view over a label set, used when building join and grouping
/// outputs.
pub struct LabelsBuilder(BTreeMap<String, String>);

impl LabelsBuilder {
    pub fn del(mut self, names: &[String]) -> Self {
        for n in names {
            self.0.remove(n);
        }
        self
    }

    pub fn del_name(mut self, name: &str) -> Self {
        self.0.remove(name);
        self
    }

    /// Drop every label not listed in `names`.
    pub fn keep(mut self, names: &[String]) -> Self {
        self.0.retain(|n, _| names.iter().any(|x| x == n));
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Labels {
        Labels(self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════
