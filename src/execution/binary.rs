use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use promql_parser::parser::token::{self, TokenType};
use promql_parser::parser::{BinModifier, LabelModifier, VectorMatchCardinality};

use crate::error::EngineError;
use crate::labels::{Labels, METRIC_NAME};
use crate::model::{Batch, StepVector, VectorPool};

use super::{ExecContext, Operator, QueryOpts};

// ═══════════════════════════════════════════════════════════════════
// Operator kinds and matching descriptor
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Unless,
}

impl BinOpKind {
    pub fn from_token(tt: TokenType) -> Result<BinOpKind, EngineError> {
        let t = tt.id();
        if t == token::T_ADD {
            return Ok(BinOpKind::Add);
        }
        if t == token::T_SUB {
            return Ok(BinOpKind::Sub);
        }
        if t == token::T_MUL {
            return Ok(BinOpKind::Mul);
        }
        if t == token::T_DIV {
            return Ok(BinOpKind::Div);
        }
        if t == token::T_MOD {
            return Ok(BinOpKind::Mod);
        }
        if t == token::T_POW {
            return Ok(BinOpKind::Pow);
        }
        if t == token::T_EQLC {
            return Ok(BinOpKind::Eq);
        }
        if t == token::T_NEQ {
            return Ok(BinOpKind::Ne);
        }
        if t == token::T_GTR {
            return Ok(BinOpKind::Gt);
        }
        if t == token::T_LSS {
            return Ok(BinOpKind::Lt);
        }
        if t == token::T_GTE {
            return Ok(BinOpKind::Ge);
        }
        if t == token::T_LTE {
            return Ok(BinOpKind::Le);
        }
        if t == token::T_LAND {
            return Ok(BinOpKind::And);
        }
        if t == token::T_LOR {
            return Ok(BinOpKind::Or);
        }
        if t == token::T_LUNLESS {
            return Ok(BinOpKind::Unless);
        }
        Err(EngineError::UnsupportedExpr(format!(
            "unsupported binary operator: {tt:?}"
        )))
    }

    pub fn is_set_op(&self) -> bool {
        matches!(self, BinOpKind::And | BinOpKind::Or | BinOpKind::Unless)
    }

    /// Combine two operands. Comparison operators in filter mode return
    /// `None` when the predicate fails and the left operand when it holds;
    /// in bool mode they return 0/1. Division and modulo by zero follow
    /// IEEE-754 (`±Inf`/`NaN`), never an error.
    pub fn apply(&self, l: f64, r: f64, return_bool: bool) -> Option<f64> {
        match self {
            BinOpKind::Add => Some(l + r),
            BinOpKind::Sub => Some(l - r),
            BinOpKind::Mul => Some(l * r),
            BinOpKind::Div => Some(l / r),
            BinOpKind::Mod => Some(l % r),
            BinOpKind::Pow => Some(l.powf(r)),
            BinOpKind::Eq => comparison(l == r, l, return_bool),
            BinOpKind::Ne => comparison(l != r, l, return_bool),
            BinOpKind::Gt => comparison(l > r, l, return_bool),
            BinOpKind::Lt => comparison(l < r, l, return_bool),
            BinOpKind::Ge => comparison(l >= r, l, return_bool),
            BinOpKind::Le => comparison(l <= r, l, return_bool),
            // Set operators act on presence, not values.
            BinOpKind::And | BinOpKind::Or | BinOpKind::Unless => None,
        }
    }
}

fn comparison(cond: bool, value: f64, return_bool: bool) -> Option<f64> {
    if return_bool {
        Some(if cond { 1.0 } else { 0.0 })
    } else if cond {
        Some(value)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
}

/// How the two sides of a vector-vector operation are joined: the label set
/// forming the join key (`on`/`ignoring`), the cardinality direction, and
/// the extra labels a `group_left`/`group_right` carries over from the
/// low-cardinality side.
#[derive(Debug, Clone)]
pub struct VectorMatching {
    pub card: MatchCardinality,
    pub on: bool,
    pub labels: Vec<String>,
    pub include: Vec<String>,
}

impl VectorMatching {
    pub fn from_modifier(modifier: &Option<BinModifier>) -> Self {
        let (on, labels) = match modifier.as_ref().and_then(|m| m.matching.as_ref()) {
            Some(LabelModifier::Include(l)) => (true, l.labels.clone()),
            Some(LabelModifier::Exclude(l)) => (false, l.labels.clone()),
            None => (false, vec![]),
        };
        let (card, include) = match modifier.as_ref().map(|m| &m.card) {
            Some(VectorMatchCardinality::ManyToOne(extra)) => {
                (MatchCardinality::ManyToOne, extra.labels.clone())
            }
            Some(VectorMatchCardinality::OneToMany(extra)) => {
                (MatchCardinality::OneToMany, extra.labels.clone())
            }
            _ => (MatchCardinality::OneToOne, vec![]),
        };
        VectorMatching {
            card,
            on,
            labels,
            include,
        }
    }

    fn signature(&self, labels: &Labels) -> u64 {
        if self.on {
            labels.hash_for(&self.labels)
        } else {
            labels.hash_without(&self.labels)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Vector ⊕ scalar
// ═══════════════════════════════════════════════════════════════════

/// Broadcast a scalar across every sample of the child. Bypasses the join
/// machinery entirely; output labels are the child's with `__name__`
/// dropped.
pub struct VectorScalarOperator {
    child: Box<dyn Operator>,
    scalar: f64,
    op: BinOpKind,
    scalar_on_lhs: bool,
    return_bool: bool,
    pool: Arc<VectorPool>,
    series: Option<Vec<Labels>>,
}

impl VectorScalarOperator {
    pub fn new(
        child: Box<dyn Operator>,
        scalar: f64,
        op: BinOpKind,
        scalar_on_lhs: bool,
        return_bool: bool,
        opts: &QueryOpts,
    ) -> Self {
        VectorScalarOperator {
            child,
            scalar,
            op,
            scalar_on_lhs,
            return_bool,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            series: None,
        }
    }

    async fn init(&mut self, ctx: &ExecContext) -> Result<(), EngineError> {
        if self.series.is_some() {
            return Ok(());
        }
        let series: Vec<Labels> = self
            .child
            .series(ctx)
            .await?
            .iter()
            .map(|l| l.builder().del_name(METRIC_NAME).build())
            .collect();
        self.pool.set_step_size(series.len());
        self.series = Some(series);
        Ok(())
    }
}

#[async_trait]
impl Operator for VectorScalarOperator {
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
        let mut batch = self.pool.get_vector_batch();
        for v in &input {
            let mut out = self.pool.get_step_vector(v.t);
            for (id, val) in v.iter() {
                let (l, r) = if self.scalar_on_lhs {
                    (self.scalar, val)
                } else {
                    (val, self.scalar)
                };
                if let Some(res) = self.op.apply(l, r, self.return_bool) {
                    out.append_sample(id, res);
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
// Vector ⊕ vector
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    generation: u64,
    val: f64,
}

/// Join state precomputed at init. Per-step work is array indexing only:
/// no hashing happens after the output index is built.
struct JoinState {
    series: Vec<Labels>,
    /// High side is the rhs when the matching is `group_right`.
    swapped: bool,
    /// High-card input id → output id, absent when the series has no
    /// matching low-card bucket.
    high_index: Vec<Option<usize>>,
    /// Low-card input id → output ids, one per high-card partner.
    low_index: Vec<Vec<usize>>,
    /// Generation-stamped scratch holding the high-card value per output.
    cache: Vec<CacheEntry>,
    generation: u64,
}

/// Presence state for `and`/`or`/`unless`: input ids map to dense signature
/// slots, and a generation-stamped array tracks which slots the other side
/// populated this step.
struct SetState {
    series: Vec<Labels>,
    lhs_slot: Vec<usize>,
    rhs_slot: Vec<usize>,
    present: Vec<u64>,
    lhs_len: usize,
    generation: u64,
}

enum State {
    Join(JoinState),
    Set(SetState),
}

impl State {
    fn series(&self) -> &[Labels] {
        match self {
            State::Join(s) => &s.series,
            State::Set(s) => &s.series,
        }
    }
}

/// `lhs ⊕ rhs` over two step-aligned inputs. Initialization buckets both
/// sides by join signature and precomputes the dense output index; each
/// step then caches high-card values by output id and combines them with
/// low-card samples.
pub struct BinaryOperator {
    lhs: Box<dyn Operator>,
    rhs: Box<dyn Operator>,
    op: BinOpKind,
    matching: VectorMatching,
    return_bool: bool,
    pool: Arc<VectorPool>,
    state: Option<State>,
    done: bool,
}

impl BinaryOperator {
    pub fn new(
        lhs: Box<dyn Operator>,
        rhs: Box<dyn Operator>,
        op: BinOpKind,
        matching: VectorMatching,
        return_bool: bool,
        opts: &QueryOpts,
    ) -> Result<Self, EngineError> {
        if op.is_set_op() && matching.card != MatchCardinality::OneToOne {
            return Err(EngineError::InvalidQuery(
                "group modifiers are not allowed on set operations".to_string(),
            ));
        }
        Ok(BinaryOperator {
            lhs,
            rhs,
            op,
            matching,
            return_bool,
            pool: Arc::new(VectorPool::new(opts.steps_batch)),
            state: None,
            done: false,
        })
    }

    async fn init(&mut self, ctx: &ExecContext) -> Result<(), EngineError> {
        if self.state.is_some() {
            return Ok(());
        }
        let lhs_series = self.lhs.series(ctx).await?.to_vec();
        let rhs_series = self.rhs.series(ctx).await?.to_vec();
        let state = if self.op.is_set_op() {
            State::Set(build_set_state(
                self.op,
                &lhs_series,
                &rhs_series,
                &self.matching,
            ))
        } else {
            State::Join(build_join_state(lhs_series, rhs_series, &self.matching)?)
        };
        self.pool.set_step_size(state.series().len());
        self.state = Some(state);
        Ok(())
    }
}

fn build_join_state(
    lhs: Vec<Labels>,
    rhs: Vec<Labels>,
    matching: &VectorMatching,
) -> Result<JoinState, EngineError> {
    let swapped = matching.card == MatchCardinality::OneToMany;
    let (high, low) = if swapped { (rhs, lhs) } else { (lhs, rhs) };

    let mut low_buckets: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, labels) in low.iter().enumerate() {
        low_buckets.entry(matching.signature(labels)).or_default().push(i);
    }

    let mut series = Vec::new();
    let mut high_index = vec![None; high.len()];
    let mut low_index = vec![Vec::new(); low.len()];
    let mut matched_sigs: HashSet<u64> = HashSet::new();

    for (hi, high_labels) in high.iter().enumerate() {
        let sig = matching.signature(high_labels);
        let Some(lows) = low_buckets.get(&sig) else {
            continue;
        };
        // The low side must be unique per bucket in every mode; the high
        // side only when no group modifier widens the join.
        if lows.len() > 1 {
            return Err(EngineError::ManyToMany);
        }
        if matching.card == MatchCardinality::OneToOne && !matched_sigs.insert(sig) {
            return Err(EngineError::ManyToMany);
        }

        let out_id = series.len();
        series.push(output_labels(high_labels, &low[lows[0]], matching));
        high_index[hi] = Some(out_id);
        low_index[lows[0]].push(out_id);
    }

    let cache = vec![CacheEntry::default(); series.len()];
    Ok(JoinState {
        series,
        swapped,
        high_index,
        low_index,
        cache,
        generation: 0,
    })
}

/// Label retention: `__name__` is always dropped. One-to-one joins keep
/// only the `on` labels or drop the `ignoring` labels; grouped joins keep
/// the full high-card label set and graft the include labels from the
/// low-card partner.
fn output_labels(high: &Labels, low: &Labels, matching: &VectorMatching) -> Labels {
    let mut b = high.builder().del_name(METRIC_NAME);
    if matching.card == MatchCardinality::OneToOne {
        if matching.on {
            b = b.keep(&matching.labels);
        } else {
            b = b.del(&matching.labels);
        }
    }
    for name in &matching.include {
        b = match low.get(name) {
            Some(value) => b.set(name, value),
            None => b.del_name(name),
        };
    }
    b.build()
}

fn build_set_state(
    op: BinOpKind,
    lhs: &[Labels],
    rhs: &[Labels],
    matching: &VectorMatching,
) -> SetState {
    let mut slots: HashMap<u64, usize> = HashMap::new();
    let mut slot_of = |labels: &Labels| {
        let sig = matching.signature(labels);
        let next = slots.len();
        *slots.entry(sig).or_insert(next)
    };
    let lhs_slot: Vec<usize> = lhs.iter().map(&mut slot_of).collect();
    let rhs_slot: Vec<usize> = rhs.iter().map(&mut slot_of).collect();

    let mut series: Vec<Labels> = lhs
        .iter()
        .map(|l| l.builder().del_name(METRIC_NAME).build())
        .collect();
    if op == BinOpKind::Or {
        series.extend(rhs.iter().map(|l| l.builder().del_name(METRIC_NAME).build()));
    }

    let present = vec![0; slots.len()];
    SetState {
        series,
        lhs_slot,
        rhs_slot,
        present,
        lhs_len: lhs.len(),
        generation: 0,
    }
}

fn eval_join_step(
    state: &mut JoinState,
    op: BinOpKind,
    return_bool: bool,
    lvec: &StepVector,
    rvec: &StepVector,
    out: &mut StepVector,
) {
    let (hvec, lowvec) = if state.swapped { (rvec, lvec) } else { (lvec, rvec) };

    state.generation += 1;
    for (id, v) in hvec.iter() {
        if let Some(out_id) = state.high_index[id] {
            state.cache[out_id] = CacheEntry {
                generation: state.generation,
                val: v,
            };
        }
    }
    for (id, v) in lowvec.iter() {
        for &out_id in &state.low_index[id] {
            let entry = state.cache[out_id];
            if entry.generation != state.generation {
                continue;
            }
            let (l, r) = if state.swapped {
                (v, entry.val)
            } else {
                (entry.val, v)
            };
            if let Some(res) = op.apply(l, r, return_bool) {
                out.append_sample(out_id, res);
            }
        }
    }
}

fn eval_set_step(
    state: &mut SetState,
    op: BinOpKind,
    lvec: &StepVector,
    rvec: &StepVector,
    out: &mut StepVector,
) {
    state.generation += 1;
    match op {
        BinOpKind::And | BinOpKind::Unless => {
            for (id, _) in rvec.iter() {
                state.present[state.rhs_slot[id]] = state.generation;
            }
            let want_present = op == BinOpKind::And;
            for (id, v) in lvec.iter() {
                if (state.present[state.lhs_slot[id]] == state.generation) == want_present {
                    out.append_sample(id, v);
                }
            }
        }
        BinOpKind::Or => {
            for (id, v) in lvec.iter() {
                state.present[state.lhs_slot[id]] = state.generation;
                out.append_sample(id, v);
            }
            for (id, v) in rvec.iter() {
                if state.present[state.rhs_slot[id]] != state.generation {
                    out.append_sample(state.lhs_len + id, v);
                }
            }
        }
        _ => unreachable!("not a set operator"),
    }
}

#[async_trait]
impl Operator for BinaryOperator {
    async fn series(&mut self, ctx: &ExecContext) -> Result<&[Labels], EngineError> {
        self.init(ctx).await?;
        Ok(self.state.as_ref().unwrap().series())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Batch>, EngineError> {
        self.init(ctx).await?;
        ctx.check()?;
        if self.done {
            return Ok(None);
        }

        let lbatch = self.lhs.next(ctx).await?;
        let rbatch = self.rhs.next(ctx).await?;

        let (lbatch, rbatch) = match (lbatch, rbatch) {
            (Some(lb), Some(rb)) if !lb.is_empty() && !rb.is_empty() => (lb, rb),
            // One side has drained: return the other side's in-flight batch
            // to its pool instead of leaking it, then report end-of-stream.
            (lb, rb) => {
                if let Some(lb) = lb {
                    self.lhs.pool().put_vectors(lb);
                }
                if let Some(rb) = rb {
                    self.rhs.pool().put_vectors(rb);
                }
                self.done = true;
                return Ok(None);
            }
        };

        if lbatch.len() != rbatch.len() {
            let expected = lbatch
                .get(rbatch.len())
                .or_else(|| rbatch.get(lbatch.len()))
                .map(|v| v.t)
                .unwrap_or_default();
            self.lhs.pool().put_vectors(lbatch);
            self.rhs.pool().put_vectors(rbatch);
            // `got` of -1 marks the step missing entirely on one side.
            return Err(EngineError::StepMisalignment { expected, got: -1 });
        }

        let misaligned = lbatch
            .iter()
            .zip(rbatch.iter())
            .find(|(l, r)| l.t != r.t)
            .map(|(l, r)| (l.t, r.t));
        if let Some((expected, got)) = misaligned {
            self.lhs.pool().put_vectors(lbatch);
            self.rhs.pool().put_vectors(rbatch);
            return Err(EngineError::StepMisalignment { expected, got });
        }

        let state = self.state.as_mut().unwrap();
        let mut batch = self.pool.get_vector_batch();
        for (lvec, rvec) in lbatch.iter().zip(rbatch.iter()) {
            let mut out = self.pool.get_step_vector(lvec.t);
            match state {
                State::Join(join) => {
                    eval_join_step(join, self.op, self.return_bool, lvec, rvec, &mut out)
                }
                State::Set(set) => eval_set_step(set, self.op, lvec, rvec, &mut out),
            }
            batch.push(out);
        }

        self.lhs.pool().put_vectors(lbatch);
        self.rhs.pool().put_vectors(rbatch);
        Ok(Some(batch))
    }

    fn pool(&self) -> Arc<VectorPool> {
        Arc::clone(&self.pool)
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════
