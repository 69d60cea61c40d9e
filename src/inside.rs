//! Inside-score sampler.
//!
//! Fills a chart of log-sum inside scores (every derivation of a labeled
//! span, not just the best), prunes each cell to a probability-mass beam,
//! and draws whole derivations top-down in proportion to their model score.
//!
//! Each cell allows at most one unary edge per label: the after-unary score
//! of `p` is its before-unary score log-added to `before[c] + score(p -> c)`
//! for every unary rule `p -> c`. Stacked unary chains are not generated, so
//! cyclic unary rules are harmless here.

use crate::chart::{CellTable, Phase, PruningMask};
use crate::decoder::{edge_cost, CostAugmenter, DecodeError, PRUNE_THRESHOLD};
use crate::grammar::Grammar;
use crate::intern::LabelId;
use crate::model::{ScoreContext, ScoringModel};
use crate::rule::{rule_code, Rule, RuleId, RuleType};
use crate::semiring::{log_sum_exp, normalize_log, LogSum, Semiring};
use crate::span::{Sentence, Span, TreeError};
use log::debug;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Builds [`InsideChart`]s for sentences.
#[derive(Clone, Debug)]
pub struct InsideSampler {
    grammar: Arc<Grammar>,
    threshold: f64,
    cost: Option<CostAugmenter>,
}

impl InsideSampler {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        InsideSampler {
            grammar,
            threshold: PRUNE_THRESHOLD,
            cost: None,
        }
    }

    /// Set the probability-mass beam. `f64::INFINITY` keeps every label.
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

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Run the inside pass for `sentence`.
    ///
    /// The chart caches every edge score it used, so sampling needs no
    /// access to the model.
    pub fn calculate_probabilities(
        &self,
        sentence: &Sentence,
        model: &dyn ScoringModel,
    ) -> Result<InsideChart, DecodeError> {
        let grammar = &*self.grammar;
        let cost = self.cost.as_ref();
        let n = sentence.len();
        let num_labels = grammar.num_labels();
        let mut chart = InsideChart {
            grammar: self.grammar.clone(),
            n,
            before: CellTable::new(n, num_labels, LogSum::zero()),
            after: CellTable::new(n, num_labels, LogSum::zero()),
            mask: PruningMask::new(n, num_labels),
            unary_scores: FxHashMap::default(),
            binary_scores: FxHashMap::default(),
        };
        if n == 0 {
            return Ok(chart);
        }

        for i in 0..n {
            let ctx = ScoreContext::new(sentence, i, i + 1, i);
            for &label in grammar.terminal_labels_for(sentence.word_id(i)) {
                let code = rule_code(RuleType::Terminal, label as RuleId);
                let score = model.score(code, &ctx) + edge_cost(cost, i, i + 1, label);
                chart.before.accumulate(i, i + 1, label, LogSum::new(score));
            }
            chart.close_cell(grammar, sentence, model, cost, i, i + 1, self.threshold);
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
                        if chart.mask.is_pruned(start, split, left, Phase::AfterUnary)
                            || chart.mask.is_pruned(split, end, right, Phase::AfterUnary)
                        {
                            continue;
                        }
                        let code = rule_code(RuleType::Binary, id as RuleId);
                        let edge = model.score(code, &ctx) + edge_cost(cost, start, end, parent);
                        chart.binary_scores.insert((start, end, split, id as RuleId), edge);
                        let inside = *chart.after.get(start, split, left)
                            * *chart.after.get(split, end, right)
                            * LogSum::new(edge);
                        chart.before.accumulate(start, end, parent, inside);
                    }
                }
                chart.close_cell(grammar, sentence, model, cost, start, end, self.threshold);
            }
        }

        debug!(
            "inside: {} words, log Z {:.4}, {} live root labels",
            n,
            chart.total_marginal(),
            chart.mask.live_count(0, n, Phase::AfterUnary)
        );
        Ok(chart)
    }
}

/// Inside scores, pruning mask and cached edge scores for one sentence.
///
/// Read-only once built, so it can be shared across sampling workers.
#[derive(Clone, Debug)]
pub struct InsideChart {
    grammar: Arc<Grammar>,
    n: usize,
    before: CellTable<LogSum>,
    after: CellTable<LogSum>,
    mask: PruningMask,
    unary_scores: FxHashMap<(usize, usize, RuleId), f64>,
    binary_scores: FxHashMap<(usize, usize, usize, RuleId), f64>,
}

impl InsideChart {
    /// Prune the before-unary scores of a cell, add one level of unary
    /// edges, then prune the after-unary scores.
    #[allow(clippy::too_many_arguments)]
    fn close_cell(
        &mut self,
        grammar: &Grammar,
        sentence: &Sentence,
        model: &dyn ScoringModel,
        cost: Option<&CostAugmenter>,
        start: usize,
        end: usize,
        threshold: f64,
    ) {
        let floor = self.before.cell_max(start, end) - threshold;
        for label in 0..grammar.num_labels() as LabelId {
            let score = self.before.get(start, end, label).value();
            let live = score > f64::NEG_INFINITY && score >= floor;
            self.mask.set_pruned(start, end, label, Phase::BeforeUnary, !live);
            if live {
                self.after.set(start, end, label, LogSum::new(score));
            }
        }

        let ctx = ScoreContext::new(sentence, start, end, start);
        for (id, rule) in grammar.unary_rules().iter().enumerate() {
            let Rule::Unary { parent, child } = *rule else {
                continue;
            };
            if self.mask.is_pruned(start, end, child, Phase::BeforeUnary) {
                continue;
            }
            let code = rule_code(RuleType::Unary, id as RuleId);
            let edge = model.score(code, &ctx) + edge_cost(cost, start, end, parent);
            self.unary_scores.insert((start, end, id as RuleId), edge);
            let inside = *self.before.get(start, end, child) * LogSum::new(edge);
            self.after.accumulate(start, end, parent, inside);
        }

        let floor = self.after.cell_max(start, end) - threshold;
        for label in 0..grammar.num_labels() as LabelId {
            let score = self.after.get(start, end, label).value();
            let live = score > f64::NEG_INFINITY && score >= floor;
            self.mask.set_pruned(start, end, label, Phase::AfterUnary, !live);
        }
    }

    pub fn sentence_len(&self) -> usize {
        self.n
    }

    /// True when the sentence was empty or nothing reached a root label.
    pub fn is_empty(&self) -> bool {
        self.root_scores().is_empty()
    }

    pub fn mask(&self) -> &PruningMask {
        &self.mask
    }

    /// Log inside score of a labeled span, `-inf` when pruned or underivable.
    pub fn inside(&self, start: usize, end: usize, label: LabelId, phase: Phase) -> f64 {
        if self.mask.is_pruned(start, end, label, phase) {
            return f64::NEG_INFINITY;
        }
        match phase {
            Phase::BeforeUnary => self.before.get(start, end, label).value(),
            Phase::AfterUnary => self.after.get(start, end, label).value(),
        }
    }

    fn root_scores(&self) -> Vec<(LabelId, f64)> {
        if self.n == 0 {
            return Vec::new();
        }
        self.grammar
            .top_level_labels()
            .iter()
            .map(|&label| (label, self.inside(0, self.n, label, Phase::AfterUnary)))
            .filter(|&(_, score)| score > f64::NEG_INFINITY)
            .collect()
    }

    /// Log partition function over accepted root labels.
    pub fn total_marginal(&self) -> f64 {
        let scores: Vec<f64> = self.root_scores().iter().map(|&(_, s)| s).collect();
        log_sum_exp(&scores)
    }

    /// Probability of each accepted root label.
    pub fn root_distribution(&self) -> Vec<(LabelId, f64)> {
        let roots = self.root_scores();
        let scores: Vec<f64> = roots.iter().map(|&(_, s)| s).collect();
        roots
            .iter()
            .zip(normalize_log(&scores))
            .map(|(&(label, _), p)| (label, p))
            .collect()
    }

    /// Log probability of a derivation with total score `score`.
    pub fn log_probability(&self, score: f64) -> f64 {
        score - self.total_marginal()
    }

    /// Draw a derivation in pre-order. `Ok(None)` when the sentence has no
    /// parse under the beam.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Option<Vec<Span>>, DecodeError> {
        let roots = self.root_scores();
        let weights: Vec<f64> = roots.iter().map(|&(_, s)| s).collect();
        let Some(pick) = sample_index(rng, &weights) else {
            return Ok(None);
        };

        let mut spans = Vec::with_capacity(2 * self.n);
        let mut stack = vec![(0, self.n, roots[pick].0, Phase::AfterUnary)];
        while let Some((start, end, label, phase)) = stack.pop() {
            match phase {
                Phase::AfterUnary => {
                    let mut options: Vec<Option<LabelId>> = Vec::new();
                    let mut weights = Vec::new();
                    let keep = self.inside(start, end, label, Phase::BeforeUnary);
                    if keep > f64::NEG_INFINITY {
                        options.push(None);
                        weights.push(keep);
                    }
                    for &id in self.grammar.unary_with_parent(label) {
                        let (Some(&edge), Some(Rule::Unary { child, .. })) =
                            (self.unary_scores.get(&(start, end, id)), self.grammar.unary_rule(id))
                        else {
                            continue;
                        };
                        let child_score = self.inside(start, end, child, Phase::BeforeUnary);
                        if child_score > f64::NEG_INFINITY {
                            options.push(Some(child));
                            weights.push(child_score + edge);
                        }
                    }
                    match sample_index(rng, &weights).map(|i| options[i]) {
                        Some(None) => stack.push((start, end, label, Phase::BeforeUnary)),
                        Some(Some(child)) => {
                            spans.push(Span::unary(start, end, label, child));
                            stack.push((start, end, child, Phase::BeforeUnary));
                        }
                        None => return Err(TreeError::MissingChild { start, end, label }.into()),
                    }
                }
                Phase::BeforeUnary if end == start + 1 => {
                    if self.inside(start, end, label, Phase::BeforeUnary) == f64::NEG_INFINITY {
                        return Err(TreeError::MissingChild { start, end, label }.into());
                    }
                    spans.push(Span::terminal(start, label));
                }
                Phase::BeforeUnary => {
                    let mut options = Vec::new();
                    let mut weights = Vec::new();
                    for split in start + 1..end {
                        for &id in self.grammar.binary_with_parent(label) {
                            let (Some(&edge), Some(Rule::Binary { left, right, .. })) = (
                                self.binary_scores.get(&(start, end, split, id)),
                                self.grammar.binary_rule(id),
                            ) else {
                                continue;
                            };
                            let score = self.inside(start, split, left, Phase::AfterUnary)
                                + self.inside(split, end, right, Phase::AfterUnary)
                                + edge;
                            if score > f64::NEG_INFINITY {
                                options.push((split, left, right));
                                weights.push(score);
                            }
                        }
                    }
                    let Some((split, left, right)) = sample_index(rng, &weights).map(|i| options[i]) else {
                        return Err(TreeError::MissingChild { start, end, label }.into());
                    };
                    spans.push(Span::binary(start, split, end, label, left, right));
                    stack.push((split, end, right, Phase::AfterUnary));
                    stack.push((start, split, left, Phase::AfterUnary));
                }
            }
        }
        Ok(Some(spans))
    }
}

/// Draw an index in proportion to `exp(log_weights[i])` by inverse CDF.
///
/// Rounding that leaves the cumulative sum short of the draw falls back to
/// the last index. `None` when every weight is `-inf`.
pub fn sample_index<R: Rng + ?Sized>(rng: &mut R, log_weights: &[f64]) -> Option<usize> {
    let probs = normalize_log(log_weights);
    if probs.is_empty() {
        return None;
    }
    let u: f64 = rng.gen::<f64>();
    let mut cumulative = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return Some(i);
        }
    }
    Some(probs.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::score_derivation;
    use crate::model::{Feature, LinearModel};
    use crate::semiring::log_add;
    use crate::span::check_well_formed;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn binary_grammar() -> Arc<Grammar> {
        let mut g = Grammar::new();
        g.add_binary_named("X", "X", "X").unwrap();
        g.add_binary_named("Y", "X", "X").unwrap();
        g.add_unary_named("Y", "X").unwrap();
        g.add_terminal_named("X").unwrap();
        g.add_top_level_named("X").unwrap();
        g.add_top_level_named("Y").unwrap();
        for w in ["a", "b", "c"] {
            g.add_word(w);
        }
        Arc::new(g)
    }

    fn weighted(g: &Grammar) -> LinearModel {
        let mut m = LinearModel::new();
        for (i, rule) in g.binary_rules().iter().chain(g.unary_rules()).enumerate() {
            let code = g.rule_code(rule).unwrap();
            m.set(Feature::Rule(code), 0.3 * i as f64 - 0.4);
            m.set(Feature::FirstWord { code, word: g.word("b") }, 0.7);
        }
        m
    }

    #[test]
    fn test_root_distribution_is_normalized() {
        let g = binary_grammar();
        let m = weighted(&g);
        let chart = InsideSampler::new(g.clone())
            .calculate_probabilities(&g.sentence(&["a", "b", "c"]), &m)
            .unwrap();
        let dist = chart.root_distribution();
        assert_eq!(dist.len(), 2);
        let total: f64 = dist.iter().map(|&(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_partition_matches_enumeration() {
        let mut g = Grammar::new();
        g.add_binary_named("X", "X", "X").unwrap();
        g.add_terminal_named("X").unwrap();
        g.add_top_level_named("X").unwrap();
        let g = Arc::new(g);
        let x = g.label("X").unwrap();
        let sentence = g.sentence(&["a", "b", "c"]);
        let m = weighted(&g);

        let left = vec![
            Span::binary(0, 2, 3, x, x, x),
            Span::binary(0, 1, 2, x, x, x),
            Span::terminal(0, x),
            Span::terminal(1, x),
            Span::terminal(2, x),
        ];
        let right = vec![
            Span::binary(0, 1, 3, x, x, x),
            Span::terminal(0, x),
            Span::binary(1, 2, 3, x, x, x),
            Span::terminal(1, x),
            Span::terminal(2, x),
        ];
        let a = score_derivation(&g, &sentence, &m, &left, false, None).unwrap();
        let b = score_derivation(&g, &sentence, &m, &right, false, None).unwrap();

        let chart = InsideSampler::new(g.clone())
            .with_threshold(f64::INFINITY)
            .calculate_probabilities(&sentence, &m)
            .unwrap();
        assert!((chart.total_marginal() - log_add(a, b)).abs() < 1e-9);
        let p = chart.log_probability(a).exp() + chart.log_probability(b).exp();
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_samples_are_well_formed() {
        let g = binary_grammar();
        let m = weighted(&g);
        let sentence = g.sentence(&["a", "b", "c", "a"]);
        let chart = InsideSampler::new(g.clone())
            .calculate_probabilities(&sentence, &m)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let spans = chart.sample(&mut rng).unwrap().unwrap();
            check_well_formed(&spans, sentence.len()).unwrap();
            for span in &spans {
                assert!(g.contains(&span.rule));
            }
        }
    }

    #[test]
    fn test_sample_frequencies() {
        let mut g = Grammar::new();
        let a = g.add_terminal_named("A").unwrap();
        let b = g.add_terminal_named("B").unwrap();
        g.add_top_level(a);
        g.add_top_level(b);
        let g = Arc::new(g);
        let mut m = LinearModel::new();
        m.set(Feature::Rule(g.rule_code(&Rule::terminal(b)).unwrap()), 3f64.ln());

        let chart = InsideSampler::new(g.clone())
            .calculate_probabilities(&g.sentence(&["w"]), &m)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let draws = 4000;
        let hits = (0..draws)
            .filter(|_| chart.sample(&mut rng).unwrap().unwrap()[0].label() == b)
            .count();
        let freq = hits as f64 / draws as f64;
        assert!((freq - 0.75).abs() < 0.05, "freq {}", freq);
    }

    #[test]
    fn test_pruning_masks() {
        let mut g = Grammar::new();
        let a = g.add_terminal_named("A").unwrap();
        let b = g.add_terminal_named("B").unwrap();
        let s = g.add_label("S").unwrap();
        g.add_unary(s, a).unwrap();
        g.add_top_level(s);
        g.add_top_level(b);
        let g = Arc::new(g);
        let mut m = LinearModel::new();
        m.set(Feature::Rule(g.rule_code(&Rule::terminal(b)).unwrap()), 5.0);

        let chart = InsideSampler::new(g.clone())
            .with_threshold(1.0)
            .calculate_probabilities(&g.sentence(&["w"]), &m)
            .unwrap();
        let mask = chart.mask();
        assert!(mask.is_pruned(0, 1, a, Phase::BeforeUnary));
        assert!(mask.is_live(0, 1, b, Phase::BeforeUnary));
        // A never survived, so S has no mass either.
        assert!(mask.is_pruned(0, 1, s, Phase::AfterUnary));
        assert_eq!(chart.root_distribution(), vec![(b, 1.0)]);

        let open = InsideSampler::new(g.clone())
            .with_threshold(f64::INFINITY)
            .calculate_probabilities(&g.sentence(&["w"]), &m)
            .unwrap();
        assert_eq!(open.mask().live_count(0, 1, Phase::AfterUnary), 3);
    }

    #[test]
    fn test_no_parse() {
        let mut g = Grammar::new();
        g.add_terminal_named("A").unwrap();
        g.add_top_level_named("S").unwrap();
        let g = Arc::new(g);
        let sampler = InsideSampler::new(g.clone());
        let mut rng = StdRng::seed_from_u64(0);

        let chart = sampler.calculate_probabilities(&g.sentence(&["w"]), &LinearModel::new()).unwrap();
        assert!(chart.is_empty());
        assert_eq!(chart.sample(&mut rng).unwrap(), None);
        assert_eq!(chart.total_marginal(), f64::NEG_INFINITY);

        let empty = sampler.calculate_probabilities(&g.sentence::<&str>(&[]), &LinearModel::new()).unwrap();
        assert_eq!(empty.sample(&mut rng).unwrap(), None);
    }

    #[test]
    fn test_cost_augmentation_moves_mass() {
        let mut g = Grammar::new();
        let a = g.add_terminal_named("A").unwrap();
        let b = g.add_terminal_named("B").unwrap();
        g.add_top_level(a);
        g.add_top_level(b);
        let g = Arc::new(g);
        let mut sampler = InsideSampler::new(g.clone());
        let sentence = g.sentence(&["w"]);

        let plain = sampler.calculate_probabilities(&sentence, &LinearModel::new()).unwrap();
        assert!((plain.root_distribution()[0].1 - 0.5).abs() < 1e-12);

        sampler.set_cost_augmenter(Some(CostAugmenter::new(&[Span::terminal(0, a)]).with_cost(2.0)));
        let augmented = sampler.calculate_probabilities(&sentence, &LinearModel::new()).unwrap();
        let dist = augmented.root_distribution();
        let p_b = dist.iter().find(|&&(l, _)| l == b).unwrap().1;
        assert!((p_b - 1.0 / (1.0 + (-2f64).exp())).abs() < 1e-9);
    }

    #[test]
    fn test_sample_index_clamps_to_last() {
        // Draws 1 - 2^-53, just below one.
        let mut rng = StepRng::new(u64::MAX, 0);
        assert_eq!(sample_index(&mut rng, &[0.0, 0.0, 0.0]), Some(2));
        assert_eq!(sample_index(&mut rng, &[0.0, f64::NEG_INFINITY]), Some(0));
        assert_eq!(sample_index(&mut rng, &[f64::NEG_INFINITY]), None);
        assert_eq!(sample_index(&mut rng, &[]), None);
    }
}
