use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::labels::{Labels, METRIC_NAME};
use crate::model::{Batch, Sample, VectorPool};
use crate::storage::SampleIter;

use super::compute::{evaluate_range_func, RangeFunc};
use super::selector::SeriesSelector;
use super::{ExecContext, Operator, QueryOpts};

/// Range-vector selector fused with its consuming function: at each step it
/// materializes, per series, the samples in `[t - range, t]` and folds them
/// through `func`. Output labels are the input labels with `__name__`
/// dropped.
pub struct MatrixSelectorOperator {
    selector: Arc<SeriesSelector>,
    func: RangeFunc,
    range_ms: i64,
    pool: Arc<VectorPool>,
    shard: usize,
    num_shards: usize,

    series: Option<Vec<Labels>>,
    buffers: Vec<WindowBuffer>,

    mint: i64,
    step: i64,
    num_steps: usize,
    steps_batch: usize,
    offset_ms: i64,
    at_ms: Option<i64>,
    current_step: usize,
}

/// Sliding-window ring over one series' decoded samples. Steps advance
/// monotonically; each sample enters and leaves the deque exactly once.
struct WindowBuffer {
    iter: Box<dyn SampleIter>,
    window: VecDeque<Sample>,
    peeked: Option<Sample>,
}

impl WindowBuffer {
    fn new(iter: Box<dyn SampleIter>) -> Self {
        WindowBuffer {
            iter,
            window: VecDeque::new(),
            peeked: None,
        }
    }

    /// Slide to the window ending at `ts` and return its samples.
    fn slide_to(&mut self, ts: i64, range_ms: i64) -> &[Sample] {
        loop {
            if self.peeked.is_none() {
                self.peeked = self.iter.next();
            }
            match self.peeked {
                Some(s) if s.t <= ts => {
                    self.window.push_back(s);
                    self.peeked = None;
                }
                _ => break,
            }
        }
        while self.window.front().is_some_and(|s| s.t < ts - range_ms) {
            self.window.pop_front();
        }
        self.window.make_contiguous();
        self.window.as_slices().0
    }
}

impl MatrixSelectorOperator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        selector: Arc<SeriesSelector>,
        func: RangeFunc,
        range_ms: i64,
        opts: &QueryOpts,
        offset_ms: i64,
        at_ms: Option<i64>,
        shard: usize,
        num_shards: usize,
    ) -> Self {
        MatrixSelectorOperator {
            selector,
            func,
            range_ms,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            shard,
            num_shards,
            series: None,
            buffers: Vec::new(),
            mint: opts.mint,
            step: opts.step,
            num_steps: opts.num_steps(),
            steps_batch: opts.steps_batch,
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
        let mut buffers = Vec::new();
        for s in all.iter().skip(self.shard).step_by(self.num_shards.max(1)) {
            series.push(s.labels().builder().del_name(METRIC_NAME).build());
            buffers.push(WindowBuffer::new(s.sample_iter(mint, maxt)));
        }
        self.pool.set_step_size(series.len());
        self.series = Some(series);
        self.buffers = buffers;
        Ok(())
    }
}

#[async_trait]
impl Operator for MatrixSelectorOperator {
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
            for (id, buf) in self.buffers.iter_mut().enumerate() {
                let window = buf.slide_to(eval_ts, self.range_ms);
                if let Some(val) =
                    evaluate_range_func(self.func, window, eval_ts - self.range_ms, eval_ts)
                {
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
