use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::labels::Labels;
use crate::model::{Batch, VectorPool};

use super::{ExecContext, Operator, QueryOpts};

/// Fan-out/fan-in exchange over N children covering disjoint series
/// partitions. Each child runs on its own worker task, pushing batches into
/// a bounded channel; the exchange drains one batch per child per `next`
/// and merges them step-aligned, rewriting sample ids by the concatenation
/// offset assigned at `series()` time. To its parent it is indistinguishable
/// from any other operator.
pub struct CoalesceOperator {
    children: Vec<Box<dyn Operator>>,
    pool: Arc<VectorPool>,
    steps_batch: usize,

    series: Option<Vec<Labels>>,
    offsets: Vec<usize>,
    child_pools: Vec<Arc<VectorPool>>,
    receivers: Vec<mpsc::Receiver<Result<Batch, EngineError>>>,
    workers: Vec<JoinHandle<()>>,
    worker_ctx: Option<ExecContext>,
    done: bool,
}

impl CoalesceOperator {
    pub fn new(children: Vec<Box<dyn Operator>>, opts: &QueryOpts) -> Self {
        CoalesceOperator {
            children,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            steps_batch: opts.steps_batch,
            series: None,
            offsets: Vec::new(),
            child_pools: Vec::new(),
            receivers: Vec::new(),
            workers: Vec::new(),
            worker_ctx: None,
            done: false,
        }
    }

    async fn init_series(&mut self, ctx: &ExecContext) -> Result<(), EngineError> {
        if self.series.is_some() {
            return Ok(());
        }
        let per_child =
            try_join_all(self.children.iter_mut().map(|c| c.series(ctx))).await?;

        let mut series = Vec::new();
        let mut offsets = Vec::with_capacity(per_child.len());
        for child_series in per_child {
            offsets.push(series.len());
            series.extend_from_slice(child_series);
        }
        self.pool.set_step_size(series.len());
        self.series = Some(series);
        self.offsets = offsets;
        Ok(())
    }

    /// Move the children onto worker tasks. Runs once, on the first `next`.
    fn start_workers(&mut self, ctx: &ExecContext) {
        if self.worker_ctx.is_some() {
            return;
        }
        let worker_ctx = ctx.child();
        tracing::debug!(workers = self.children.len(), "coalesce fan-out starting");
        for child in self.children.drain(..) {
            let (tx, rx) = mpsc::channel(2 * self.steps_batch);
            self.child_pools.push(child.pool());
            self.receivers.push(rx);
            self.workers.push(tokio::spawn(produce(
                child,
                tx,
                worker_ctx.clone(),
            )));
        }
        self.worker_ctx = Some(worker_ctx);
    }
}

/// Producer loop for one child: pull batches and push them downstream until
/// end-of-stream, an error, cancellation, or the consumer going away.
async fn produce(
    mut child: Box<dyn Operator>,
    tx: mpsc::Sender<Result<Batch, EngineError>>,
    ctx: ExecContext,
) {
    loop {
        let result = child.next(&ctx).await;
        let (message, stop) = match result {
            Ok(Some(batch)) => (Ok(batch), false),
            Ok(None) => break,
            Err(e) => (Err(e), true),
        };
        tokio::select! {
            _ = ctx.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() || stop {
                    break;
                }
            }
        }
    }
    tracing::trace!("coalesce worker exiting");
}

#[async_trait]
impl Operator for CoalesceOperator {
    async fn series(&mut self, ctx: &ExecContext) -> Result<&[Labels], EngineError> {
        self.init_series(ctx).await?;
        Ok(self.series.as_deref().unwrap())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
        ctx.check()?;
        if self.done {
            return Ok(None);
        }
        self.init_series(ctx).await?;
        self.start_workers(ctx);

        let mut merged: Option<Batch> = None;
        let mut open = 0usize;
        for (c, rx) in self.receivers.iter_mut().enumerate() {
            let Some(result) = rx.recv().await else {
                continue;
            };
            open += 1;
            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    if let Some(w) = &self.worker_ctx {
                        w.cancel();
                    }
                    return Err(e);
                }
            };
            match merged.as_mut() {
                None if self.offsets[c] == 0 => merged = Some(batch),
                None => {
                    // First responding child is not the first partition:
                    // rebase its ids onto the concatenated space.
                    let mut base = batch;
                    for v in &mut base {
                        for id in &mut v.sample_ids {
                            *id += self.offsets[c];
                        }
                    }
                    merged = Some(base);
                }
                Some(base) => {
                    let misaligned = base.len() != batch.len()
                        || base.iter().zip(batch.iter()).any(|(a, b)| a.t != b.t);
                    if misaligned {
                        let expected = base.first().map(|v| v.t).unwrap_or_default();
                        let got = batch.first().map(|v| v.t).unwrap_or(-1);
                        self.child_pools[c].put_vectors(batch);
                        if let Some(w) = &self.worker_ctx {
                            w.cancel();
                        }
                        return Err(EngineError::StepMisalignment { expected, got });
                    }
                    for (dst, src) in base.iter_mut().zip(batch.iter()) {
                        for (id, v) in src.iter() {
                            dst.append_sample(id + self.offsets[c], v);
                        }
                    }
                    self.child_pools[c].put_vectors(batch);
                }
            }
        }

        if open == 0 {
            self.done = true;
            return Ok(None);
        }
        Ok(merged)
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}

impl Drop for CoalesceOperator {
    fn drop(&mut self) {
        // Receivers are dropped with self; waking the workers makes them
        // observe that promptly even when blocked on a full channel.
        if let Some(w) = &self.worker_ctx {
            w.cancel();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::execution::testing::MockOperator;

    fn opts() -> QueryOpts {
        QueryOpts::new(&EngineConfig::default(), 0, 0, 0)
    }

    fn child(name: &str, steps: Vec<(i64, Vec<(usize, f64)>)>) -> Box<dyn Operator> {
        Box::new(MockOperator::new(
            vec![Labels::from_pairs([("worker", name)])],
            steps,
        ))
    }

    #[tokio::test]
    async fn test_series_concatenation_and_id_rewrite() {
        let ctx = ExecContext::new();
        let mut op = CoalesceOperator::new(
            vec![
                child("a", vec![(0, vec![(0, 1.0)]), (1000, vec![(0, 2.0)])]),
                child("b", vec![(0, vec![(0, 10.0)]), (1000, vec![])]),
            ],
            &opts(),
        );

        let series = op.series(&ctx).await.unwrap().to_vec();
        assert_eq!(
            series,
            vec![
                Labels::from_pairs([("worker", "a")]),
                Labels::from_pairs([("worker", "b")]),
            ]
        );

        let batch = op.next(&ctx).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].t, 0);
        assert_eq!(batch[0].sample_ids, vec![0, 1]);
        assert_eq!(batch[0].samples, vec![1.0, 10.0]);
        assert_eq!(batch[1].sample_ids, vec![0], "second child empty at t=1000");
        op.pool().put_vectors(batch);

        assert!(op.next(&ctx).await.unwrap().is_none());
        assert!(op.next(&ctx).await.unwrap().is_none(), "end-of-stream is sticky");
    }

    #[tokio::test]
    async fn test_merge_preserves_step_order_across_batches() {
        let ctx = ExecContext::new();
        let steps: Vec<(i64, Vec<(usize, f64)>)> =
            (0..25).map(|k| (k * 1000, vec![(0, k as f64)])).collect();
        let mut op = CoalesceOperator::new(
            vec![
                Box::new(MockOperator::new(
                    vec![Labels::from_pairs([("worker", "a")])],
                    steps.clone(),
                )
                .with_steps_batch(10)) as Box<dyn Operator>,
                Box::new(MockOperator::new(
                    vec![Labels::from_pairs([("worker", "b")])],
                    steps,
                )
                .with_steps_batch(10)) as Box<dyn Operator>,
            ],
            &opts(),
        );

        let mut timestamps = Vec::new();
        while let Some(batch) = op.next(&ctx).await.unwrap() {
            for v in &batch {
                timestamps.push(v.t);
                assert_eq!(v.len(), 2);
            }
            op.pool().put_vectors(batch);
        }
        let expected: Vec<i64> = (0..25).map(|k| k * 1000).collect();
        assert_eq!(timestamps, expected);
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_as_canceled() {
        let ctx = ExecContext::new();
        let mut op = CoalesceOperator::new(vec![child("a", vec![(0, vec![(0, 1.0)])])], &opts());
        ctx.cancel();
        let err = op.next(&ctx).await.unwrap_err();
        assert!(err.is_canceled());
    }
}
