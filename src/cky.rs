//! Exact CKY decoder.
//!
//! Bottom-up Viterbi over `(start, end, label)` with two values per slot:
//! the best score using binary rules or a terminal only ("before unary"),
//! and the best score after unary closure within the cell ("after unary").
//! Backpointers are kept in parallel tables and followed with an explicit
//! stack to rebuild the winning derivation.

use crate::chart::{CellTable, Phase};
use crate::decoder::{
    edge_cost, CostAugmenter, DecodeError, Decoder, Derivation, MAX_UNARY_ITERATIONS,
};
use crate::grammar::Grammar;
use crate::intern::LabelId;
use crate::model::{ScoreContext, ScoringModel};
use crate::rule::{rule_code, Rule, RuleId, RuleType};
use crate::span::{Sentence, Span, TreeError};
use log::{debug, trace, warn};
use std::sync::Arc;

/// How a chart value was derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Back {
    None,
    Terminal,
    Binary { rule: RuleId, split: usize },
    Unary { child: LabelId },
    /// After-unary value taken unchanged from the before-unary value.
    Keep,
}

/// Viterbi chart shared by the exact and the beam-pruned decoders.
pub(crate) struct ViterbiChart {
    n: usize,
    num_labels: usize,
    pub(crate) before: CellTable<f64>,
    pub(crate) after: CellTable<f64>,
    before_back: CellTable<Back>,
    after_back: CellTable<Back>,
}

impl ViterbiChart {
    pub(crate) fn new(n: usize, num_labels: usize) -> Self {
        ViterbiChart {
            n,
            num_labels,
            before: CellTable::new(n, num_labels, f64::NEG_INFINITY),
            after: CellTable::new(n, num_labels, f64::NEG_INFINITY),
            before_back: CellTable::new(n, num_labels, Back::None),
            after_back: CellTable::new(n, num_labels, Back::None),
        }
    }

    /// Score every terminal label allowed at each position.
    pub(crate) fn fill_terminals(
        &mut self,
        grammar: &Grammar,
        sentence: &Sentence,
        model: &dyn ScoringModel,
        cost: Option<&CostAugmenter>,
    ) {
        for i in 0..self.n {
            let ctx = ScoreContext::new(sentence, i, i + 1, i);
            for &label in grammar.terminal_labels_for(sentence.word_id(i)) {
                let code = rule_code(RuleType::Terminal, label as RuleId);
                let score = model.score(code, &ctx) + edge_cost(cost, i, i + 1, label);
                self.before.set(i, i + 1, label, score);
                self.before_back.set(i, i + 1, label, Back::Terminal);
            }
        }
    }

    /// Offer a binary combination for `(start, end, parent)`.
    ///
    /// Returns whether it became the best before-unary derivation.
    #[inline]
    pub(crate) fn offer_binary(
        &mut self,
        start: usize,
        end: usize,
        parent: LabelId,
        score: f64,
        rule: RuleId,
        split: usize,
    ) -> bool {
        if score > *self.before.get(start, end, parent) {
            self.before.set(start, end, parent, score);
            self.before_back.set(start, end, parent, Back::Binary { rule, split });
            true
        } else {
            false
        }
    }

    /// Apply unary rules within one cell until no label improves.
    ///
    /// Rules run in the grammar's bottom-up unary order, so an acyclic
    /// grammar settles in two passes.
    ///
    /// Only children scoring at least `floor` are expanded. A unary edge
    /// `child -> parent` is rejected when `parent` already appears in the
    /// unary chain below `child`.
    pub(crate) fn close_unaries(
        &mut self,
        grammar: &Grammar,
        sentence: &Sentence,
        model: &dyn ScoringModel,
        cost: Option<&CostAugmenter>,
        start: usize,
        end: usize,
        floor: f64,
    ) -> Result<usize, DecodeError> {
        for label in 0..self.num_labels as LabelId {
            let score = *self.before.get(start, end, label);
            if score > f64::NEG_INFINITY {
                self.after.set(start, end, label, score);
                self.after_back.set(start, end, label, Back::Keep);
            }
        }

        let ctx = ScoreContext::new(sentence, start, end, start);
        let mut rule_scores: Vec<Option<f64>> = vec![None; grammar.unary_rules().len()];
        let mut updates = 0;
        let mut iteration = 0;
        let mut last_changed: Vec<LabelId> = Vec::new();
        loop {
            if iteration >= MAX_UNARY_ITERATIONS {
                let names: Vec<String> = last_changed.iter().map(|&l| grammar.labels().name(l).to_string()).collect();
                return Err(DecodeError::CyclicUnaryChain(format!(
                    "unary closure of [{}, {}) still changing after {} passes: {}",
                    start,
                    end,
                    iteration,
                    names.join(", ")
                )));
            }
            iteration += 1;

            let mut changed: Vec<LabelId> = Vec::new();
            for &id in grammar.unary_order() {
                let Some(Rule::Unary { parent, child }) = grammar.unary_rule(id) else {
                    continue;
                };
                let child_score = *self.after.get(start, end, child);
                if child_score == f64::NEG_INFINITY || child_score < floor {
                    continue;
                }
                let rule_score = *rule_scores[id as usize].get_or_insert_with(|| {
                    let code = rule_code(RuleType::Unary, id);
                    model.score(code, &ctx) + edge_cost(cost, start, end, parent)
                });
                let score = child_score + rule_score;
                if score > *self.after.get(start, end, parent)
                    && !self.chain_contains(start, end, child, parent)
                {
                    self.after.set(start, end, parent, score);
                    self.after_back.set(start, end, parent, Back::Unary { child });
                    if !changed.contains(&parent) {
                        changed.push(parent);
                    }
                    updates += 1;
                }
            }
            if changed.is_empty() {
                break;
            }
            last_changed = changed;
        }
        if updates > 0 {
            trace!("unary closure [{}, {}): {} updates in {} passes", start, end, updates, iteration);
        }
        Ok(updates)
    }

    /// Whether `target` occurs in the after-unary chain starting at `from`.
    fn chain_contains(&self, start: usize, end: usize, from: LabelId, target: LabelId) -> bool {
        let mut current = from;
        for _ in 0..=self.num_labels {
            if current == target {
                return true;
            }
            match *self.after_back.get(start, end, current) {
                Back::Unary { child } => current = child,
                _ => return false,
            }
        }
        // A chain longer than the label count already loops.
        true
    }

    /// Best accepted root label over the whole sentence.
    pub(crate) fn best_root(&self, grammar: &Grammar) -> Option<(LabelId, f64)> {
        let mut best: Option<(LabelId, f64)> = None;
        for &label in grammar.top_level_labels() {
            if label as usize >= self.num_labels {
                continue;
            }
            let score = *self.after.get(0, self.n, label);
            if score == f64::NEG_INFINITY {
                continue;
            }
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((label, score));
            }
        }
        best
    }

    /// Rebuild the derivation rooted at `root`, in pre-order.
    pub(crate) fn backtrack(&self, grammar: &Grammar, root: LabelId) -> Result<Vec<Span>, DecodeError> {
        let limit = 2 * self.n * (self.num_labels + 1);
        let mut spans = Vec::with_capacity(2 * self.n);
        let mut stack = vec![(0, self.n, root, Phase::AfterUnary)];

        while let Some((start, end, label, phase)) = stack.pop() {
            if spans.len() > limit {
                return Err(DecodeError::CyclicUnaryChain(format!(
                    "backtrace through [{}, {}) does not terminate",
                    start, end
                )));
            }
            let back = match phase {
                Phase::AfterUnary => *self.after_back.get(start, end, label),
                Phase::BeforeUnary => *self.before_back.get(start, end, label),
            };
            match back {
                Back::Keep => stack.push((start, end, label, Phase::BeforeUnary)),
                Back::Unary { child } => {
                    spans.push(Span::unary(start, end, label, child));
                    stack.push((start, end, child, Phase::AfterUnary));
                }
                Back::Terminal => spans.push(Span::terminal(start, label)),
                Back::Binary { rule, split } => {
                    let Some(Rule::Binary { parent, left, right }) = grammar.binary_rule(rule) else {
                        return Err(DecodeError::UnknownRule(format!("binary rule #{}", rule)));
                    };
                    spans.push(Span::binary(start, split, end, parent, left, right));
                    stack.push((split, end, right, Phase::AfterUnary));
                    stack.push((start, split, left, Phase::AfterUnary));
                }
                Back::None => {
                    return Err(TreeError::MissingChild { start, end, label }.into());
                }
            }
        }
        Ok(spans)
    }
}

/// Refuse grammars whose unary rules form a cycle.
pub(crate) fn check_unary_cycles(grammar: &Grammar) -> Result<(), DecodeError> {
    match grammar.unary_cycle() {
        Some(cycle) => {
            let names: Vec<String> = cycle
                .iter()
                .map(|&l| grammar.labels().name(l).to_string())
                .collect();
            Err(DecodeError::CyclicUnaryChain(names.join(" -> ")))
        }
        None => Ok(()),
    }
}

/// Exact max-score decoder.
#[derive(Clone, Debug)]
pub struct CkyDecoder {
    grammar: Arc<Grammar>,
    cost: Option<CostAugmenter>,
}

impl CkyDecoder {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        CkyDecoder {
            grammar,
            cost: None,
        }
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Install a cost augmenter with a custom cost, or remove it.
    pub fn set_cost_augmenter(&mut self, cost: Option<CostAugmenter>) {
        self.cost = cost;
    }

    fn fill(&self, sentence: &Sentence, model: &dyn ScoringModel) -> Result<ViterbiChart, DecodeError> {
        let grammar = &*self.grammar;
        let cost = self.cost.as_ref();
        let n = sentence.len();
        let mut chart = ViterbiChart::new(n, grammar.num_labels());

        chart.fill_terminals(grammar, sentence, model, cost);
        for i in 0..n {
            chart.close_unaries(grammar, sentence, model, cost, i, i + 1, f64::NEG_INFINITY)?;
        }

        for width in 2..=n {
            for start in 0..=n - width {
                let end = start + width;
                for split in start + 1..end {
                    let ctx = ScoreContext::new(sentence, start, end, split);
                    for (id, rule) in grammar.binary_rules().iter().enumerate() {
                        let Rule::Binary { parent, left, right } = *rule else {
                            continue;
                        };
                        let left_score = *chart.after.get(start, split, left);
                        if left_score == f64::NEG_INFINITY {
                            continue;
                        }
                        let right_score = *chart.after.get(split, end, right);
                        if right_score == f64::NEG_INFINITY {
                            continue;
                        }
                        let code = rule_code(RuleType::Binary, id as RuleId);
                        let score = left_score
                            + right_score
                            + model.score(code, &ctx)
                            + edge_cost(cost, start, end, parent);
                        chart.offer_binary(start, end, parent, score, id as RuleId, split);
                    }
                }
                chart.close_unaries(grammar, sentence, model, cost, start, end, f64::NEG_INFINITY)?;
            }
        }
        Ok(chart)
    }
}

impl Decoder for CkyDecoder {
    fn decode(&self, sentence: &Sentence, model: &dyn ScoringModel) -> Result<Option<Derivation>, DecodeError> {
        check_unary_cycles(&self.grammar)?;
        if sentence.is_empty() {
            return Ok(None);
        }

        let chart = self.fill(sentence, model)?;
        let Some((root, score)) = chart.best_root(&self.grammar) else {
            warn!("no parse for sentence of {} words", sentence.len());
            return Ok(None);
        };
        let spans = chart.backtrack(&self.grammar, root)?;
        debug!(
            "cky: {} words, root {} score {:.4}, {} spans",
            sentence.len(),
            self.grammar.labels().name(root),
            score,
            spans.len()
        );
        Ok(Some(Derivation::new(spans, score)))
    }

    fn set_cost_augmenting(&mut self, enabled: bool, gold: &[Span]) -> Result<(), DecodeError> {
        self.cost = enabled.then(|| CostAugmenter::new(gold));
        Ok(())
    }

    fn set_second_order(&mut self, enabled: bool) -> Result<(), DecodeError> {
        if enabled {
            return Err(DecodeError::Unsupported {
                decoder: "CkyDecoder",
                feature: "second-order scoring",
            });
        }
        Ok(())
    }
}
