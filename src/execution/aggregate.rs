use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use promql_parser::parser::token::{self, TokenType};

use crate::error::EngineError;
use crate::labels::{Labels, METRIC_NAME};
use crate::model::{Batch, VectorPool};

use super::{ExecContext, Operator, QueryOpts};

/// Grouping aggregations evaluated per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Min,
    Max,
    Avg,
    Count,
    Group,
}

impl AggOp {
    pub fn from_token(tt: TokenType) -> Result<AggOp, EngineError> {
        let t = tt.id();
        if t == token::T_SUM {
            return Ok(AggOp::Sum);
        }
        if t == token::T_MIN {
            return Ok(AggOp::Min);
        }
        if t == token::T_MAX {
            return Ok(AggOp::Max);
        }
        if t == token::T_AVG {
            return Ok(AggOp::Avg);
        }
        if t == token::T_COUNT {
            return Ok(AggOp::Count);
        }
        if t == token::T_GROUP {
            return Ok(AggOp::Group);
        }
        Err(EngineError::UnsupportedExpr(format!(
            "unsupported aggregation: {tt:?}"
        )))
    }
}

/// `op by|without (labels) expr`: folds every input sample into its group's
/// accumulator and emits one sample per group that saw input this step.
/// Grouping is precomputed at init as a dense `input_id → group_id` map, so
/// the per-step loop is pure array indexing.
pub struct AggregateOperator {
    child: Box<dyn Operator>,
    op: AggOp,
    grouping: Vec<String>,
    without: bool,
    pool: Arc<VectorPool>,

    series: Option<Vec<Labels>>,
    group_of: Vec<usize>,
    accs: Vec<GroupAcc>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupAcc {
    generation: u64,
    sum: f64,
    count: f64,
    extreme: f64,
}

impl AggregateOperator {
    pub fn new(
        child: Box<dyn Operator>,
        op: AggOp,
        grouping: Vec<String>,
        without: bool,
        opts: &QueryOpts,
    ) -> Self {
        AggregateOperator {
            child,
            op,
            grouping,
            without,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            series: None,
            group_of: Vec::new(),
            accs: Vec::new(),
            generation: 0,
        }
    }

    async fn init(&mut self, ctx: &ExecContext) -> Result<(), EngineError> {
        if self.series.is_some() {
            return Ok(());
        }
        let input = self.child.series(ctx).await?;

        let mut series: Vec<Labels> = Vec::new();
        let mut group_of = Vec::with_capacity(input.len());
        let mut group_by_sig: HashMap<u64, usize> = HashMap::new();

        for labels in input {
            let sig = if self.without {
                labels.hash_without(&self.grouping)
            } else {
                labels.hash_for(&self.grouping)
            };
            let group = *group_by_sig.entry(sig).or_insert_with(|| {
                let out = if self.without {
                    labels
                        .builder()
                        .del(&self.grouping)
                        .del_name(METRIC_NAME)
                        .build()
                } else {
                    labels.builder().keep(&self.grouping).build()
                };
                series.push(out);
                series.len() - 1
            });
            group_of.push(group);
        }

        self.pool.set_step_size(series.len());
        self.accs = vec![GroupAcc::default(); series.len()];
        self.series = Some(series);
        self.group_of = group_of;
        Ok(())
    }

    fn fold(&mut self, id: usize, v: f64) {
        let acc = &mut self.accs[self.group_of[id]];
        if acc.generation != self.generation {
            acc.generation = self.generation;
            acc.sum = 0.0;
            acc.count = 0.0;
            acc.extreme = v;
        }
        acc.sum += v;
        acc.count += 1.0;
        match self.op {
            // First occurrence wins ties; an NaN extreme is displaced by any
            // real value (Prometheus semantics, not IEEE).
            AggOp::Min => {
                if v < acc.extreme || acc.extreme.is_nan() {
                    acc.extreme = v;
                }
            }
            AggOp::Max => {
                if v > acc.extreme || acc.extreme.is_nan() {
                    acc.extreme = v;
                }
            }
            _ => {}
        }
    }

    fn emit(&self, group: usize) -> Option<f64> {
        let acc = &self.accs[group];
        if acc.generation != self.generation {
            return None;
        }
        Some(match self.op {
            AggOp::Sum => acc.sum,
            AggOp::Avg => acc.sum / acc.count,
            AggOp::Count => acc.count,
            AggOp::Min | AggOp::Max => acc.extreme,
            AggOp::Group => 1.0,
        })
    }
}

#[async_trait]
impl Operator for AggregateOperator {
    async fn series(&mut self, ctx: &ExecContext) -> Result<&[Labels], EngineError> {
        self.init(ctx).await?;
        Ok(self.series.as_deref().unwrap())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
        self.init(ctx).await?;
        ctx.check()?;

        let Some(input) = self.child.next(ctx).await? else {
            return Ok(None);
        };

        let groups = self.series.as_ref().unwrap().len();
        let mut batch = self.pool.get_vector_batch();
        for v in &input {
            self.generation += 1;
            for (id, val) in v.iter() {
                self.fold(id, val);
            }
            let mut out = self.pool.get_step_vector(v.t);
            for group in 0..groups {
                if let Some(val) = self.emit(group) {
                    out.append_sample(group, val);
                }
            }
            batch.push(out);
        }
        self.child.pool().put_vectors(input);
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
    use crate::execution::testing::MockOperator;

    fn opts() -> QueryOpts {
        QueryOpts::new(&EngineConfig::default(), 0, 0, 0)
    }

    fn three_series() -> Vec<Labels> {
        vec![
            Labels::from_pairs([("__name__", "m"), ("pod", "a"), ("node", "1")]),
            Labels::from_pairs([("__name__", "m"), ("pod", "b"), ("node", "1")]),
            Labels::from_pairs([("__name__", "m"), ("pod", "a"), ("node", "2")]),
        ]
    }

    async fn run(
        op: AggOp,
        grouping: &[&str],
        without: bool,
        values: Vec<(usize, f64)>,
    ) -> (Vec<Labels>, Vec<(usize, f64)>) {
        let ctx = ExecContext::new();
        let child = MockOperator::new(three_series(), vec![(0, values)]);
        let mut agg = AggregateOperator::new(
            Box::new(child),
            op,
            grouping.iter().map(|s| s.to_string()).collect(),
            without,
            &opts(),
        );
        let series = agg.series(&ctx).await.unwrap().to_vec();
        let batch = agg.next(&ctx).await.unwrap().unwrap();
        let out = batch[0].iter().collect();
        agg.pool().put_vectors(batch);
        (series, out)
    }

    #[tokio::test]
    async fn test_sum_by() {
        let (series, out) = run(
            AggOp::Sum,
            &["pod"],
            false,
            vec![(0, 1.0), (1, 2.0), (2, 3.0)],
        )
        .await;
        assert_eq!(
            series,
            vec![
                Labels::from_pairs([("pod", "a")]),
                Labels::from_pairs([("pod", "b")]),
            ]
        );
        assert_eq!(out, vec![(0, 4.0), (1, 2.0)]);
    }

    #[tokio::test]
    async fn test_without_drops_metric_name() {
        let (series, _) = run(
            AggOp::Sum,
            &["node"],
            true,
            vec![(0, 1.0), (1, 2.0), (2, 3.0)],
        )
        .await;
        assert_eq!(
            series,
            vec![
                Labels::from_pairs([("pod", "a")]),
                Labels::from_pairs([("pod", "b")]),
            ]
        );
    }

    #[tokio::test]
    async fn test_avg_and_count() {
        let (_, avg) = run(AggOp::Avg, &[], false, vec![(0, 1.0), (1, 2.0), (2, 6.0)]).await;
        assert_eq!(avg, vec![(0, 3.0)]);
        let (_, count) = run(AggOp::Count, &[], false, vec![(0, 1.0), (2, 6.0)]).await;
        assert_eq!(count, vec![(0, 2.0)]);
    }

    #[tokio::test]
    async fn test_min_max_nan_is_displaced() {
        let (_, max) = run(
            AggOp::Max,
            &[],
            false,
            vec![(0, f64::NAN), (1, 2.0), (2, 1.0)],
        )
        .await;
        assert_eq!(max, vec![(0, 2.0)]);
        let (_, min) = run(AggOp::Min, &[], false, vec![(0, f64::NAN), (1, 2.0)]).await;
        assert_eq!(min, vec![(0, 2.0)]);
    }

    #[tokio::test]
    async fn test_group_emits_one() {
        let (_, out) = run(AggOp::Group, &["pod"], false, vec![(0, 9.0), (2, 7.0)]).await;
        assert_eq!(out, vec![(0, 1.0)]);
    }

    #[tokio::test]
    async fn test_groups_without_samples_are_absent() {
        let (_, out) = run(AggOp::Sum, &["pod"], false, vec![(1, 2.0)]).await;
        // Only pod="b" saw input at this step.
        assert_eq!(out, vec![(1, 2.0)]);
    }

    #[tokio::test]
    async fn test_sum_propagates_nan() {
        let (_, out) = run(AggOp::Sum, &[], false, vec![(0, f64::NAN), (1, 2.0)]).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].1.is_nan());
    }
}
