use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::labels::Labels;
use crate::model::{Batch, Sample, VectorPool};
use crate::storage::SampleIter;

use super::selector::SeriesSelector;
use super::{ExecContext, Operator, QueryOpts};

/// Instant-vector selector over one shard of a storage selection. At each
/// step it emits, per series, the most recent sample within the staleness
/// window `[t - lookback, t]`, where `t` has been adjusted for `offset` and
/// `@` first.
pub struct VectorSelectorOperator {
    selector: Arc<SeriesSelector>,
    pool: Arc<VectorPool>,
    shard: usize,
    num_shards: usize,

    series: Option<Vec<Labels>>,
    scanners: Vec<PointBuffer>,

    mint: i64,
    step: i64,
    num_steps: usize,
    steps_batch: usize,
    lookback: i64,
    offset_ms: i64,
    at_ms: Option<i64>,
    current_step: usize,
}

/// Per-series decode cursor: remembers the most recent sample at or before
/// the current evaluation timestamp. Steps advance monotonically, so each
/// stored sample is visited once.
struct PointBuffer {
    iter: Box<dyn SampleIter>,
    last: Option<Sample>,
    peeked: Option<Sample>,
}

impl PointBuffer {
    fn new(iter: Box<dyn SampleIter>) -> Self {
        PointBuffer {
            iter,
            last: None,
            peeked: None,
        }
    }

    fn read_at(&mut self, ts: i64, lookback: i64) -> Option<f64> {
        loop {
            if self.peeked.is_none() {
                self.peeked = self.iter.next();
            }
            match self.peeked {
                Some(s) if s.t <= ts => {
                    self.last = self.peeked.take();
                }
                _ => break,
            }
        }
        self.last
            .filter(|s| s.t >= ts - lookback)
            .map(|s| s.v)
    }
}

impl VectorSelectorOperator {
    pub fn new(
        selector: Arc<SeriesSelector>,
        opts: &QueryOpts,
        offset_ms: i64,
        at_ms: Option<i64>,
        shard: usize,
        num_shards: usize,
    ) -> Self {
        VectorSelectorOperator {
            selector,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            shard,
            num_shards,
            series: None,
            scanners: Vec::new(),
            mint: opts.mint,
            step: opts.step,
            num_steps: opts.num_steps(),
            steps_batch: opts.steps_batch,
            lookback: opts.lookback_delta,
            offset_ms,
            at_ms,
            current_step: 0,
        }
    }

    fn init(&mut self) -> Result<(), EngineError> {
        if self.series.is_some() {
            return Ok(());
        }
        let all = self.selector.series()?;
        let (mint, maxt) = self.selector.time_range();
        let mut series = Vec::new();
        let mut scanners = Vec::new();
        for s in all.iter().skip(self.shard).step_by(self.num_shards.max(1)) {
            series.push(s.labels().clone());
            scanners.push(PointBuffer::new(s.sample_iter(mint, maxt)));
        }
        self.pool.set_step_size(series.len());
        self.series = Some(series);
        self.scanners = scanners;
        Ok(())
    }
}

#[async_trait]
impl Operator for VectorSelectorOperator {
    async fn series(&mut self, _ctx: &ExecContext) -> Result<&[Labels], EngineError> {
        self.init()?;
        Ok(self.series.as_deref().unwrap())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
        self.init()?;
        if self.current_step >= self.num_steps {
            return Ok(None);
        }
        let mut batch = self.pool.get_vector_batch();
        while self.current_step < self.num_steps && batch.len() < self.steps_batch {
            ctx.check()?;
            let t = self.mint + self.current_step as i64 * self.step;
            let eval_ts = self.at_ms.unwrap_or(t) - self.offset_ms;
            let mut v = self.pool.get_step_vector(t);
            for (id, scanner) in self.scanners.iter_mut().enumerate() {
                if let Some(val) = scanner.read_at(eval_ts, self.lookback) {
                    v.append_sample(id, val);
                }
            }
            batch.push(v);
            self.current_step += 1;
        }
        Ok(Some(batch))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::{MemoryStorage, SeriesStorage};
    use promql_parser::parser::{self, Expr};

    fn vs_for(query: &str) -> promql_parser::parser::VectorSelector {
        match parser::parse(query).unwrap() {
            Expr::VectorSelector(vs) => vs,
            other => panic!("expected vector selector, got {other:?}"),
        }
    }

    fn storage() -> Arc<dyn SeriesStorage> {
        let mut s = MemoryStorage::new();
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("a", "1")]),
            [(1000, 10.0), (2000, 20.0)],
        );
        s.add_series(
            Labels::from_pairs([("__name__", "m"), ("a", "2")]),
            [(1500, 5.0)],
        );
        Arc::new(s)
    }

    fn opts(mint: i64, maxt: i64, step: i64) -> QueryOpts {
        let cfg = EngineConfig {
            steps_batch: 10,
            parallelism: 1,
            ..EngineConfig::default()
        };
        QueryOpts::new(&cfg, mint, maxt, step)
    }

    fn selector(storage: &Arc<dyn SeriesStorage>, opts: &QueryOpts) -> Arc<SeriesSelector> {
        Arc::new(SeriesSelector::new(
            Arc::clone(storage),
            &vs_for("m"),
            opts.mint - opts.lookback_delta,
            opts.maxt,
        ))
    }

    #[tokio::test]
    async fn test_most_recent_sample_within_lookback() {
        let ctx = ExecContext::new();
        let storage = storage();
        let opts = opts(0, 3000, 1000);
        let mut op =
            VectorSelectorOperator::new(selector(&storage, &opts), &opts, 0, None, 0, 1);

        assert_eq!(op.series(&ctx).await.unwrap().len(), 2);

        let batch = op.next(&ctx).await.unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        // t=0: nothing yet.
        assert!(batch[0].is_empty());
        // t=1000: only series 0 has a sample.
        assert_eq!(batch[1].sample_ids, vec![0]);
        assert_eq!(batch[1].samples, vec![10.0]);
        // t=2000: series 0 advanced, series 1 holds its 1500ms sample.
        assert_eq!(batch[2].sample_ids, vec![0, 1]);
        assert_eq!(batch[2].samples, vec![20.0, 5.0]);
        // t=3000: both still within the 5m lookback.
        assert_eq!(batch[3].samples, vec![20.0, 5.0]);
        op.pool().put_vectors(batch);

        assert!(op.next(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookback_expiry() {
        let ctx = ExecContext::new();
        let storage = storage();
        let mut opts = opts(0, 400_000, 100_000);
        opts.lookback_delta = 100_000;
        let mut op =
            VectorSelectorOperator::new(selector(&storage, &opts), &opts, 0, None, 0, 1);

        let batch = op.next(&ctx).await.unwrap().unwrap();
        // Samples from t<=2000 are stale after 100s+2s.
        assert!(!batch[1].is_empty(), "fresh at t=100000");
        assert!(batch[2].is_empty(), "stale at t=200000");
        op.pool().put_vectors(batch);
    }

    #[tokio::test]
    async fn test_sharding_partitions_series() {
        let ctx = ExecContext::new();
        let storage = storage();
        let opts = opts(2000, 2000, 0);
        let sel = selector(&storage, &opts);
        let mut shard0 = VectorSelectorOperator::new(Arc::clone(&sel), &opts, 0, None, 0, 2);
        let mut shard1 = VectorSelectorOperator::new(Arc::clone(&sel), &opts, 0, None, 1, 2);

        let s0 = shard0.series(&ctx).await.unwrap().to_vec();
        let s1 = shard1.series(&ctx).await.unwrap().to_vec();
        assert_eq!(s0.len(), 1);
        assert_eq!(s1.len(), 1);
        assert_ne!(s0[0], s1[0]);
    }

    #[tokio::test]
    async fn test_offset_shifts_evaluation_time() {
        let ctx = ExecContext::new();
        let storage = storage();
        let opts = opts(2000, 2000, 0);
        let mut op = VectorSelectorOperator::new(
            selector(&storage, &opts),
            &opts,
            1000, // offset 1s: evaluates at t=1000
            None,
            0,
            1,
        );
        let batch = op.next(&ctx).await.unwrap().unwrap();
        assert_eq!(batch[0].t, 2000, "output timestamp is unshifted");
        assert_eq!(batch[0].sample_ids, vec![0]);
        assert_eq!(batch[0].samples, vec![10.0]);
        op.pool().put_vectors(batch);
    }
}
