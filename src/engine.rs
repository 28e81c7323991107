use std::sync::Arc;
use std::time::Instant;

use promql_parser::parser;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{new_operator, ExecContext, QueryOpts};
use crate::labels::Labels;
use crate::model::{QueryValue, Sample, TimeSeries, VectorSample};
use crate::storage::SeriesStorage;

/// Query driver: parses the expression, builds the operator tree, pumps the
/// root until end-of-stream, and assembles the result. Operator trees are
/// built per query and never shared.
pub struct Engine {
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine { config }
    }

    /// Evaluate `query` at the single instant `ts` (ms).
    pub async fn instant_query(
        &self,
        storage: Arc<dyn SeriesStorage>,
        query: &str,
        ts: i64,
    ) -> Result<QueryValue, EngineError> {
        let opts = QueryOpts::new(&self.config, ts, ts, 0);
        let (series, rows) = self.execute(storage, query, &opts).await?;

        let mut vector = Vec::new();
        for (labels, row) in series.into_iter().zip(rows) {
            if let Some(sample) = row.first() {
                vector.push(VectorSample {
                    labels,
                    t: sample.t,
                    v: sample.v,
                });
            }
        }
        Ok(QueryValue::Vector(vector))
    }

    /// Evaluate `query` at every instant `mint + k·step` up to `maxt` (ms).
    pub async fn range_query(
        &self,
        storage: Arc<dyn SeriesStorage>,
        query: &str,
        mint: i64,
        maxt: i64,
        step: i64,
    ) -> Result<QueryValue, EngineError> {
        if step <= 0 {
            return Err(EngineError::InvalidQuery(
                "range query step must be positive".to_string(),
            ));
        }
        if maxt < mint {
            return Err(EngineError::InvalidQuery(
                "range query end precedes start".to_string(),
            ));
        }
        let opts = QueryOpts::new(&self.config, mint, maxt, step);
        let (series, rows) = self.execute(storage, query, &opts).await?;

        let matrix = series
            .into_iter()
            .zip(rows)
            .filter(|(_, row)| !row.is_empty())
            .map(|(labels, samples)| TimeSeries { labels, samples })
            .collect();
        Ok(QueryValue::Matrix(matrix))
    }

    async fn execute(
        &self,
        storage: Arc<dyn SeriesStorage>,
        query: &str,
        opts: &QueryOpts,
    ) -> Result<(Vec<Labels>, Vec<Vec<Sample>>), EngineError> {
        let started = Instant::now();
        let expr = parser::parse(query).map_err(|e| EngineError::Parse(format!("{e}")))?;
        let mut root = new_operator(&expr, &storage, opts)?;

        let ctx = ExecContext::new();
        let series = root.series(&ctx).await?.to_vec();
        tracing::debug!(
            query,
            series = series.len(),
            steps = opts.num_steps(),
            "executing plan"
        );

        let mut rows: Vec<Vec<Sample>> = vec![Vec::new(); series.len()];
        let pool = root.pool();
        loop {
            match root.next(&ctx).await {
                Ok(Some(batch)) => {
                    for v in &batch {
                        for (id, val) in v.iter() {
                            rows[id].push(Sample::new(v.t, val));
                        }
                    }
                    pool.put_vectors(batch);
                }
                Ok(None) => break,
                Err(e) => {
                    // First error wins; wake every in-flight worker so the
                    // pipeline drains promptly.
                    ctx.cancel();
                    if !e.is_canceled() {
                        tracing::error!(query, error = %e, "query failed");
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(query, elapsed = ?started.elapsed(), "query complete");
        Ok((series, rows))
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════
