//! The decoder interface shared by every search strategy.
//!
//! `decode` distinguishes two outcomes that must never be conflated:
//! - `Ok(None)`: the grammar cannot parse the sentence (expected)
//! - `Err(DecodeError)`: a grammar or consistency violation (fatal for the sentence)

use crate::grammar::Grammar;
use crate::intern::LabelId;
use crate::model::{ScoreContext, ScoringModel};
use crate::span::{check_well_formed, root_index, Sentence, Span, TreeError};
use rustc_hash::FxHashSet;
use std::fmt::Write;
use thiserror::Error;

/// Beam gap, in log-score units, below a cell's best score.
pub const PRUNE_THRESHOLD: f64 = 10.0;

/// Passes of unary closure allowed per cell before giving up.
pub const MAX_UNARY_ITERATIONS: usize = 10;

/// Default cost added to edges that disagree with the gold tree.
pub const DEFAULT_COST: f64 = 1.0;

/// Fatal decoding errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("cyclic unary chain: {0}")]
    CyclicUnaryChain(String),
    #[error("malformed derivation: {0}")]
    Malformed(#[from] TreeError),
    #[error("rule not in grammar: {0}")]
    UnknownRule(String),
    #[error("{decoder} does not support {feature}")]
    Unsupported {
        decoder: &'static str,
        feature: &'static str,
    },
    #[error("worker pool failed: {0}")]
    WorkerPool(String),
}

/// A decoded tree with its model score.
#[derive(Clone, Debug, PartialEq)]
pub struct Derivation {
    pub spans: Vec<Span>,
    pub score: f64,
}

impl Derivation {
    pub fn new(spans: Vec<Span>, score: f64) -> Self {
        Derivation { spans, score }
    }

    /// Label of the top-level span.
    pub fn root_label(&self) -> Option<LabelId> {
        let parents = crate::span::parent_map(&self.spans).ok()?;
        root_index(&parents).map(|i| self.spans[i].label())
    }

    /// Render as a bracketed tree, e.g. `(S (NP (PRP I)) ...)`.
    pub fn to_bracketed(&self, grammar: &Grammar, sentence: &Sentence) -> Result<String, TreeError> {
        let parents = check_well_formed(&self.spans, sentence.len())?;
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.spans.len()];
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = parent {
                children[*p].push(i);
            }
        }
        for list in &mut children {
            list.sort_by_key(|&i| self.spans[i].start);
        }
        let root = root_index(&parents).ok_or(TreeError::NoRoot)?;

        let mut out = String::new();
        self.write_bracketed(root, &children, grammar, sentence, &mut out);
        Ok(out)
    }

    fn write_bracketed(
        &self,
        at: usize,
        children: &[Vec<usize>],
        grammar: &Grammar,
        sentence: &Sentence,
        out: &mut String,
    ) {
        let span = &self.spans[at];
        let _ = write!(out, "({}", grammar.labels().name(span.label()));
        if span.is_terminal() {
            let _ = write!(out, " {}", sentence.token(span.start).unwrap_or("?"));
        }
        for &child in &children[at] {
            out.push(' ');
            self.write_bracketed(child, children, grammar, sentence, out);
        }
        out.push(')');
    }
}

/// Adds a constant to every edge whose label disagrees with the gold tree.
///
/// An edge over `[start, end)` with label `l` agrees with the gold tree when
/// the gold tree has a span over the same interval with the same label.
#[derive(Clone, Debug, Default)]
pub struct CostAugmenter {
    gold: FxHashSet<(usize, usize, LabelId)>,
    cost: f64,
}

impl CostAugmenter {
    pub fn new(gold: &[Span]) -> Self {
        CostAugmenter {
            gold: gold.iter().map(|s| (s.start, s.end, s.label())).collect(),
            cost: DEFAULT_COST,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    #[inline]
    pub fn cost(&self, start: usize, end: usize, label: LabelId) -> f64 {
        if self.gold.contains(&(start, end, label)) {
            0.0
        } else {
            self.cost
        }
    }
}

/// Optional cost lookup, zero when cost augmentation is off.
#[inline]
pub(crate) fn edge_cost(cost: Option<&CostAugmenter>, start: usize, end: usize, label: LabelId) -> f64 {
    cost.map_or(0.0, |c| c.cost(start, end, label))
}

/// Common interface of the search strategies.
pub trait Decoder {
    /// Best derivation of `sentence` under `model`, or `None` if the grammar
    /// cannot parse it.
    fn decode(&self, sentence: &Sentence, model: &dyn ScoringModel) -> Result<Option<Derivation>, DecodeError>;

    /// Turn cost augmentation against `gold` on or off.
    fn set_cost_augmenting(&mut self, enabled: bool, gold: &[Span]) -> Result<(), DecodeError>;

    /// Turn second-order (parent-conditioned) scoring on or off.
    fn set_second_order(&mut self, enabled: bool) -> Result<(), DecodeError>;
}

/// Model score of a complete derivation, with optional second-order and
/// cost terms. Fails if the derivation is malformed or uses a rule the
/// grammar does not contain.
pub fn score_derivation(
    grammar: &Grammar,
    sentence: &Sentence,
    model: &dyn ScoringModel,
    spans: &[Span],
    second_order: bool,
    cost: Option<&CostAugmenter>,
) -> Result<f64, DecodeError> {
    let parents = check_well_formed(spans, sentence.len())?;
    score_with_parents(grammar, sentence, model, spans, &parents, second_order, cost)
}

/// [`score_derivation`] with a parent map that is already known.
pub fn score_with_parents(
    grammar: &Grammar,
    sentence: &Sentence,
    model: &dyn ScoringModel,
    spans: &[Span],
    parents: &[Option<usize>],
    second_order: bool,
    cost: Option<&CostAugmenter>,
) -> Result<f64, DecodeError> {
    let mut total = 0.0;
    for (i, span) in spans.iter().enumerate() {
        let code = grammar
            .rule_code(&span.rule)
            .ok_or_else(|| DecodeError::UnknownRule(grammar.describe(&span.rule)))?;
        let ctx = ScoreContext::for_span(sentence, span);
        total += model.score(code, &ctx);
        if second_order {
            if let Some(p) = parents[i] {
                total += model.parent_score(code, spans[p].label(), &ctx);
            }
        }
        total += edge_cost(cost, span.start, span.end, span.label());
    }
    Ok(total)
}
