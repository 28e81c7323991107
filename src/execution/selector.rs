use std::sync::{Arc, Mutex};

use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::VectorSelector;

use crate::error::EngineError;
use crate::labels::METRIC_NAME;
use crate::storage::{SeriesStorage, StorageSeries};

/// One storage selection shared by all shards of a partitioned selector.
/// The matchers run once; each shard then reads its stride of the cached
/// result, so the adaptor sees a single `select` per plan leaf no matter the
/// fan-out.
pub struct SeriesSelector {
    storage: Arc<dyn SeriesStorage>,
    matchers: Vec<Matcher>,
    mint: i64,
    maxt: i64,
    cache: Mutex<Option<Arc<Vec<Arc<dyn StorageSeries>>>>>,
}

impl SeriesSelector {
    pub fn new(
        storage: Arc<dyn SeriesStorage>,
        vs: &VectorSelector,
        mint: i64,
        maxt: i64,
    ) -> Self {
        let mut matchers = vs.matchers.matchers.clone();
        if let Some(name) = &vs.name {
            if !name.is_empty() && !matchers.iter().any(|m| m.name == METRIC_NAME) {
                matchers.push(Matcher {
                    op: MatchOp::Equal,
                    name: METRIC_NAME.to_string(),
                    value: name.clone(),
                });
            }
        }
        SeriesSelector {
            storage,
            matchers,
            mint,
            maxt,
            cache: Mutex::new(None),
        }
    }

    /// The matched series, selected on first use.
    pub fn series(&self) -> Result<Arc<Vec<Arc<dyn StorageSeries>>>, EngineError> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(series) = cache.as_ref() {
            return Ok(Arc::clone(series));
        }
        let selected = Arc::new(self.storage.select(&self.matchers, self.mint, self.maxt)?);
        tracing::debug!(
            matched = selected.len(),
            mint = self.mint,
            maxt = self.maxt,
            "selector matched series"
        );
        *cache = Some(Arc::clone(&selected));
        Ok(selected)
    }

    pub fn time_range(&self) -> (i64, i64) {
        (self.mint, self.maxt)
    }
}
