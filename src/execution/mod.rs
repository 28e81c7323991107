pub mod aggregate;
pub mod binary;
pub mod coalesce;
pub mod compute;
pub mod literal;
pub mod matrix_selector;
pub mod selector;
pub mod vector_selector;

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use promql_parser::parser::{AtModifier, Expr, Offset, VectorSelector};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::labels::Labels;
use crate::model::{Batch, VectorPool};
use crate::storage::SeriesStorage;

use aggregate::{AggOp, AggregateOperator};
use binary::{BinOpKind, BinaryOperator, VectorMatching, VectorScalarOperator};
use coalesce::CoalesceOperator;
use compute::RangeFunc;
use literal::NumberLiteralOperator;
use matrix_selector::MatrixSelectorOperator;
use selector::SeriesSelector;
use vector_selector::VectorSelectorOperator;

// ═══════════════════════════════════════════════════════════════════
// Operator contract
// ═══════════════════════════════════════════════════════════════════

/// The pull-based execution protocol every plan node obeys.
///
/// `series` is idempotent: the output label list is computed once on first
/// call (by either `series` or the first `next`) and cached. `next` returns
/// `None` at end-of-stream and keeps returning `None` if called again.
/// Consumers return pulled batches to the child's pool when done with them.
#[async_trait]
pub trait Operator: Send {
    async fn series(&mut self, ctx: &ExecContext) -> Result<&[Labels], EngineError>;

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError>;

    fn pool(&self) -> Arc<VectorPool>;
}

/// Cancellation context threaded through every `series` and `next` call.
/// Operators check it at least once per batch; the coalesce exchange hands a
/// child token to its producer workers.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    token: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        ExecContext {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Per-query execution parameters shared by every operator in one plan.
#[derive(Debug, Clone)]
pub struct QueryOpts {
    /// First evaluation instant, ms.
    pub mint: i64,
    /// Last evaluation instant, ms.
    pub maxt: i64,
    /// Spacing between instants, ms. `0` means an instant query.
    pub step: i64,
    pub steps_batch: usize,
    pub parallelism: usize,
    pub lookback_delta: i64,
    pub enable_at_modifier: bool,
}

impl QueryOpts {
    pub fn new(cfg: &EngineConfig, mint: i64, maxt: i64, step: i64) -> Self {
        QueryOpts {
            mint,
            maxt,
            step,
            steps_batch: cfg.steps_batch.max(1),
            parallelism: cfg.parallelism.max(1),
            lookback_delta: cfg.lookback_delta_ms,
            enable_at_modifier: cfg.enable_at_modifier,
        }
    }

    pub fn num_steps(&self) -> usize {
        if self.step == 0 {
            1
        } else {
            ((self.maxt - self.mint) / self.step) as usize + 1
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Plan construction
// ═══════════════════════════════════════════════════════════════════

/// Map a parsed expression tree onto a physical operator tree. Selectors are
/// partitioned across `opts.parallelism` shards behind a coalesce exchange;
/// every other node holds owned children.
pub fn new_operator(
    expr: &Expr,
    storage: &Arc<dyn SeriesStorage>,
    opts: &QueryOpts,
) -> Result<Box<dyn Operator>, EngineError> {
    match expr {
        Expr::NumberLiteral(num) => Ok(Box::new(NumberLiteralOperator::new(num.val, opts))),

        Expr::Paren(paren) => new_operator(&paren.expr, storage, opts),

        // PromQL unary is always negation; expressed as `-1 * expr` so the
        // scalar combinator owns the arithmetic.
        Expr::Unary(unary) => {
            let child = new_operator(&unary.expr, storage, opts)?;
            Ok(Box::new(VectorScalarOperator::new(
                child,
                -1.0,
                BinOpKind::Mul,
                true,
                false,
                opts,
            )))
        }

        Expr::VectorSelector(vs) => new_vector_selector(vs, storage, opts),

        Expr::MatrixSelector(_) => Err(EngineError::UnsupportedExpr(
            "matrix selector must be wrapped in a range function".to_string(),
        )),

        Expr::Call(call) => {
            let name = call.func.name;
            let func = RangeFunc::from_name(name).ok_or_else(|| {
                EngineError::UnsupportedExpr(format!("unsupported function: {name}"))
            })?;
            let arg = call
                .args
                .args
                .first()
                .ok_or_else(|| {
                    EngineError::InvalidQuery(format!("{name} requires a range-vector argument"))
                })?
                .as_ref();
            let ms = match unwrap_parens(arg) {
                Expr::MatrixSelector(ms) => ms,
                _ => {
                    return Err(EngineError::InvalidQuery(format!(
                        "{name} requires a range-vector argument"
                    )));
                }
            };
            let range_ms = ms.range.as_millis() as i64;
            if range_ms <= 0 {
                return Err(EngineError::InvalidQuery(format!(
                    "{name} requires a positive range"
                )));
            }
            new_matrix_selector(&ms.vs, func, range_ms, storage, opts)
        }

        Expr::Aggregate(agg) => {
            let op = AggOp::from_token(agg.op)?;
            let (labels, without) = match &agg.modifier {
                Some(promql_parser::parser::LabelModifier::Include(l)) => (l.labels.clone(), false),
                Some(promql_parser::parser::LabelModifier::Exclude(l)) => (l.labels.clone(), true),
                None => (vec![], false),
            };
            let child = new_operator(&agg.expr, storage, opts)?;
            Ok(Box::new(AggregateOperator::new(
                child, op, labels, without, opts,
            )))
        }

        Expr::Binary(bin) => {
            let op = BinOpKind::from_token(bin.op)?;
            let return_bool = bin
                .modifier
                .as_ref()
                .is_some_and(|m| m.return_bool);

            // Scalar operands bypass the join: the scalar is broadcast over
            // the other side's samples.
            let lhs_scalar = extract_scalar(&bin.lhs);
            let rhs_scalar = extract_scalar(&bin.rhs);
            match (lhs_scalar, rhs_scalar) {
                (Some(l), None) => {
                    let child = new_operator(&bin.rhs, storage, opts)?;
                    Ok(Box::new(VectorScalarOperator::new(
                        child, l, op, true, return_bool, opts,
                    )))
                }
                (None, Some(r)) => {
                    let child = new_operator(&bin.lhs, storage, opts)?;
                    Ok(Box::new(VectorScalarOperator::new(
                        child, r, op, false, return_bool, opts,
                    )))
                }
                (Some(_), Some(r)) => {
                    // scalar ⊕ scalar: evaluate the left side as a literal
                    // stream and fold the right side in as a broadcast.
                    let child = new_operator(&bin.lhs, storage, opts)?;
                    Ok(Box::new(VectorScalarOperator::new(
                        child, r, op, false, return_bool, opts,
                    )))
                }
                (None, None) => {
                    let lhs = new_operator(&bin.lhs, storage, opts)?;
                    let rhs = new_operator(&bin.rhs, storage, opts)?;
                    let matching = VectorMatching::from_modifier(&bin.modifier);
                    Ok(Box::new(BinaryOperator::new(
                        lhs,
                        rhs,
                        op,
                        matching,
                        return_bool,
                        opts,
                    )?))
                }
            }
        }

        Expr::StringLiteral(_) => Err(EngineError::UnsupportedExpr(
            "string literals cannot be evaluated".to_string(),
        )),
        Expr::Subquery(_) => Err(EngineError::UnsupportedExpr(
            "subqueries are not supported".to_string(),
        )),
        Expr::Extension(_) => Err(EngineError::UnsupportedExpr(
            "extension expressions are not supported".to_string(),
        )),
    }
}

fn new_vector_selector(
    vs: &VectorSelector,
    storage: &Arc<dyn SeriesStorage>,
    opts: &QueryOpts,
) -> Result<Box<dyn Operator>, EngineError> {
    let (offset_ms, at_ms) = selector_timing(vs, opts)?;
    let (start, end) = eval_time_span(opts, offset_ms, at_ms);
    let selector = Arc::new(SeriesSelector::new(
        Arc::clone(storage),
        vs,
        start - opts.lookback_delta,
        end,
    ));

    let shards = opts.parallelism;
    let children: Vec<Box<dyn Operator>> = (0..shards)
        .map(|shard| {
            Box::new(VectorSelectorOperator::new(
                Arc::clone(&selector),
                opts,
                offset_ms,
                at_ms,
                shard,
                shards,
            )) as Box<dyn Operator>
        })
        .collect();
    Ok(coalesce_shards(children, opts))
}

fn new_matrix_selector(
    vs: &VectorSelector,
    func: RangeFunc,
    range_ms: i64,
    storage: &Arc<dyn SeriesStorage>,
    opts: &QueryOpts,
) -> Result<Box<dyn Operator>, EngineError> {
    let (offset_ms, at_ms) = selector_timing(vs, opts)?;
    let (start, end) = eval_time_span(opts, offset_ms, at_ms);
    let selector = Arc::new(SeriesSelector::new(
        Arc::clone(storage),
        vs,
        start - range_ms,
        end,
    ));

    let shards = opts.parallelism;
    let children: Vec<Box<dyn Operator>> = (0..shards)
        .map(|shard| {
            Box::new(MatrixSelectorOperator::new(
                Arc::clone(&selector),
                func,
                range_ms,
                opts,
                offset_ms,
                at_ms,
                shard,
                shards,
            )) as Box<dyn Operator>
        })
        .collect();
    Ok(coalesce_shards(children, opts))
}

fn coalesce_shards(mut children: Vec<Box<dyn Operator>>, opts: &QueryOpts) -> Box<dyn Operator> {
    if children.len() == 1 {
        children.pop().unwrap()
    } else {
        Box::new(CoalesceOperator::new(children, opts))
    }
}

/// Resolve `offset` and `@` into an offset in ms and an optional pinned
/// evaluation timestamp.
fn selector_timing(vs: &VectorSelector, opts: &QueryOpts) -> Result<(i64, Option<i64>), EngineError> {
    let offset_ms = match &vs.offset {
        Some(Offset::Pos(d)) => d.as_millis() as i64,
        Some(Offset::Neg(d)) => -(d.as_millis() as i64),
        None => 0,
    };
    let at_ms = match &vs.at {
        Some(at) => {
            if !opts.enable_at_modifier {
                return Err(EngineError::InvalidQuery(
                    "@ modifier is disabled".to_string(),
                ));
            }
            Some(match at {
                AtModifier::Start => opts.mint,
                AtModifier::End => opts.maxt,
                AtModifier::At(st) => st
                    .duration_since(UNIX_EPOCH)
                    .map_err(|_| {
                        EngineError::InvalidQuery("@ timestamp precedes epoch".to_string())
                    })?
                    .as_millis() as i64,
            })
        }
        None => None,
    };
    Ok((offset_ms, at_ms))
}

/// The span of effective evaluation timestamps this selector will read at,
/// after applying `@` and `offset`.
fn eval_time_span(opts: &QueryOpts, offset_ms: i64, at_ms: Option<i64>) -> (i64, i64) {
    match at_ms {
        Some(at) => (at - offset_ms, at - offset_ms),
        None => (opts.mint - offset_ms, opts.maxt - offset_ms),
    }
}

fn unwrap_parens(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(p) => unwrap_parens(&p.expr),
        other => other,
    }
}

/// A numeric constant operand, looking through parens and unary minus.
fn extract_scalar(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::NumberLiteral(n) => Some(n.val),
        Expr::Paren(p) => extract_scalar(&p.expr),
        Expr::Unary(u) => extract_scalar(&u.expr).map(|v| -v),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted operator for unit tests: emits the given steps one batch at
    /// a time.
    pub(crate) struct MockOperator {
        series: Vec<Labels>,
        steps: VecDeque<(i64, Vec<(usize, f64)>)>,
        steps_batch: usize,
        pool: Arc<VectorPool>,
    }

    impl MockOperator {
        pub(crate) fn new(series: Vec<Labels>, steps: Vec<(i64, Vec<(usize, f64)>)>) -> Self {
            MockOperator {
                series,
                steps: steps.into(),
                steps_batch: 10,
                pool: Arc::new(VectorPool::new(10)),
            }
        }

        pub(crate) fn with_steps_batch(mut self, steps_batch: usize) -> Self {
            self.steps_batch = steps_batch;
            self
        }
    }

    #[async_trait]
    impl Operator for MockOperator {
        async fn series(&mut self, _ctx: &ExecContext) -> Result<&[Labels], EngineError> {
            Ok(&self.series)
        }

        async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
            ctx.check()?;
            if self.steps.is_empty() {
                return Ok(None);
            }
            let mut batch = self.pool.get_vector_batch();
            while batch.len() < self.steps_batch {
                let Some((t, samples)) = self.steps.pop_front() else {
                    break;
                };
                let mut v = self.pool.get_step_vector(t);
                for (id, val) in samples {
                    v.append_sample(id, val);
                }
                batch.push(v);
            }
            Ok(Some(batch))
        }

        fn pool(&self) -> Arc<VectorPool> {
            Arc::clone(&self.pool)
        }
    }
}
