use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::labels::Labels;
use crate::model::{Batch, VectorPool};

use super::{ExecContext, Operator, QueryOpts};

/// Seeds the pipeline with a constant: one synthetic series whose value is
/// `v` at every step. Used wherever a scalar appears in a vector context.
pub struct NumberLiteralOperator {
    value: f64,
    series: [Labels; 1],
    pool: Arc<VectorPool>,
    num_steps: usize,
    current_step: usize,
    steps_batch: usize,
    mint: i64,
    step: i64,
}

impl NumberLiteralOperator {
    pub fn new(value: f64, opts: &QueryOpts) -> Self {
        let pool = Arc::new(VectorPool::new(opts.steps_batch));
        pool.set_step_size(1);
        NumberLiteralOperator {
            value,
            series: [Labels::empty()],
            pool,
            num_steps: opts.num_steps(),
            current_step: 0,
            steps_batch: opts.steps_batch,
            mint: opts.mint,
            step: opts.step,
        }
    }
}

#[async_trait]
impl Operator for NumberLiteralOperator {
    async fn series(&mut self, _ctx: &ExecContext) -> Result<&[Labels], EngineError> {
        Ok(&self.series)
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
        ctx.check()?;
        if self.current_step >= self.num_steps {
            return Ok(None);
        }
        let mut batch = self.pool.get_vector_batch();
        while self.current_step < self.num_steps && batch.len() < self.steps_batch {
            let t = self.mint + self.current_step as i64 * self.step;
            let mut v = self.pool.get_step_vector(t);
            v.append_sample(0, self.value);
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
