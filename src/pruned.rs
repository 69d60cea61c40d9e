//! Beam-pruned CKY decoder.
//!
//! Same chart as [`CkyDecoder`](crate::cky::CkyDecoder), but a child
//! combination is skipped when either child scores more than `threshold`
//! below the best score of its own cell, and a candidate is dropped when it
//! falls more than `threshold` below the running best of the cell being
//! built. The running best is updated inside the inner loop, so the beam
//! tightens as better combinations are found.
//!
//! The result is the best derivation under the beam: never better than the
//! exact decoder, and identical to it when the threshold is infinite.

use crate::chart::CellTable;
use crate::cky::{check_unary_cycles, ViterbiChart};
use crate::decoder::{edge_cost, CostAugmenter, DecodeError, Decoder, Derivation, PRUNE_THRESHOLD};
use crate::grammar::Grammar;
use crate::model::{ScoreContext, ScoringModel};
use crate::rule::{rule_code, Rule, RuleId, RuleType};
use crate::semiring::{MaxPlus, Semiring};
use crate::span::{Sentence, Span};
use log::{debug, warn};
use std::sync::Arc;

/// Counters from one pruned decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeamStats {
    /// Child combinations evaluated with the model.
    pub scored: usize,
    /// Combinations skipped because a child fell outside its cell's beam.
    pub pruned_children: usize,
    /// Candidates dropped against the running best of their own cell.
    pub pruned_candidates: usize,
}

/// Beam-pruned max-score decoder.
#[derive(Clone, Debug)]
pub struct PrunedDecoder {
    grammar: Arc<Grammar>,
    threshold: f64,
    cost: Option<CostAugmenter>,
}

impl PrunedDecoder {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        PrunedDecoder {
            grammar,
            threshold: PRUNE_THRESHOLD,
            cost: None,
        }
    }

    /// Set the beam gap. `f64::INFINITY` disables pruning.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_cost_augmenter(&mut self, cost: Option<CostAugmenter>) {
        self.cost = cost;
    }

    /// Decode and report beam counters.
    pub fn decode_with_stats(
        &self,
        sentence: &Sentence,
        model: &dyn ScoringModel,
    ) -> Result<(Option<Derivation>, BeamStats), DecodeError> {
        check_unary_cycles(&self.grammar)?;
        let mut stats = BeamStats::default();
        if sentence.is_empty() {
            return Ok((None, stats));
        }

        let chart = self.fill(sentence, model, &mut stats)?;
        let Some((root, score)) = chart.best_root(&self.grammar) else {
            warn!("no parse under beam {} for sentence of {} words", self.threshold, sentence.len());
            return Ok((None, stats));
        };
        let spans = chart.backtrack(&self.grammar, root)?;
        debug!(
            "pruned cky: {} words, root {} score {:.4}, {:?}",
            sentence.len(),
            self.grammar.labels().name(root),
            score,
            stats
        );
        Ok((Some(Derivation::new(spans, score)), stats))
    }

    fn fill(
        &self,
        sentence: &Sentence,
        model: &dyn ScoringModel,
        stats: &mut BeamStats,
    ) -> Result<ViterbiChart, DecodeError> {
        let grammar = &*self.grammar;
        let cost = self.cost.as_ref();
        let threshold = self.threshold;
        let n = sentence.len();
        let mut chart = ViterbiChart::new(n, grammar.num_labels());

        // Best after-unary score of every finished cell.
        let mut cell_best: CellTable<MaxPlus> = CellTable::new(n, 1, MaxPlus::zero());

        chart.fill_terminals(grammar, sentence, model, cost);
        for i in 0..n {
            let floor = chart.before.cell_best(i, i + 1) - threshold;
            chart.close_unaries(grammar, sentence, model, cost, i, i + 1, floor)?;
            cell_best.accumulate(i, i + 1, 0, MaxPlus::new(chart.after.cell_best(i, i + 1)));
        }

        for width in 2..=n {
            for start in 0..=n - width {
                let end = start + width;
                let mut running = MaxPlus::zero();

                for split in start + 1..end {
                    let left_floor = cell_best.get(start, split, 0).value() - threshold;
                    let right_floor = cell_best.get(split, end, 0).value() - threshold;
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
                        if left_score < left_floor || right_score < right_floor {
                            stats.pruned_children += 1;
                            continue;
                        }

                        let code = rule_code(RuleType::Binary, id as RuleId);
                        let score = left_score
                            + right_score
                            + model.score(code, &ctx)
                            + edge_cost(cost, start, end, parent);
                        stats.scored += 1;
                        if score < running.value() - threshold {
                            stats.pruned_candidates += 1;
                            continue;
                        }
                        running = running + MaxPlus::new(score);
                        chart.offer_binary(start, end, parent, score, id as RuleId, split);
                    }
                }

                let floor = running.value() - threshold;
                chart.close_unaries(grammar, sentence, model, cost, start, end, floor)?;
                cell_best.accumulate(start, end, 0, MaxPlus::new(chart.after.cell_best(start, end)));
            }
        }
        Ok(chart)
    }
}

impl Decoder for PrunedDecoder {
    fn decode(&self, sentence: &Sentence, model: &dyn ScoringModel) -> Result<Option<Derivation>, DecodeError> {
        self.decode_with_stats(sentence, model).map(|(derivation, _)| derivation)
    }

    fn set_cost_augmenting(&mut self, enabled: bool, gold: &[Span]) -> Result<(), DecodeError> {
        self.cost = enabled.then(|| CostAugmenter::new(gold));
        Ok(())
    }

    fn set_second_order(&mut self, enabled: bool) -> Result<(), DecodeError> {
        if enabled {
            return Err(DecodeError::Unsupported {
                decoder: "PrunedDecoder",
                feature: "second-order scoring",
            });
        }
        Ok(())
    }
}
