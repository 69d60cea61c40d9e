//! Randomized-greedy search.
//!
//! Each restart draws a tree from the inside chart and hill-climbs it with
//! the local moves of [`crate::surgery`]: for every node in pre-order, score
//! all of its relabelings and reattachments and adopt the best one if it is
//! strictly better. Sweeps repeat until one changes nothing. Restarts run
//! on a fixed-size rayon pool and skip samples some worker already climbed.

use crate::decoder::{
    score_with_parents, CostAugmenter, DecodeError, Decoder, Derivation, PRUNE_THRESHOLD,
};
use crate::grammar::Grammar;
use crate::inside::{InsideChart, InsideSampler};
use crate::model::ScoringModel;
use crate::span::{canonical, Sentence, Span};
use crate::surgery::{Alternative, ParseTree};
use dashmap::DashSet;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::AddAssign;
use std::sync::{Arc, OnceLock};

/// Configuration for [`RandomizedGreedy`].
#[derive(Debug, Clone, PartialEq)]
pub struct GreedyConfig {
    /// Worker threads.
    pub workers: usize,
    /// Restarts run by each worker.
    pub restarts_per_worker: usize,
    /// Upper bound on hill-climbing sweeps per restart.
    pub max_sweeps: usize,
    /// Base seed; worker `w` uses `seed + w`. `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Beam of the inside chart the restarts sample from.
    pub prune_threshold: f64,
}

impl Default for GreedyConfig {
    fn default() -> Self {
        GreedyConfig {
            workers: 4,
            restarts_per_worker: 8,
            max_sweeps: 50,
            seed: None,
            prune_threshold: PRUNE_THRESHOLD,
        }
    }
}

impl GreedyConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_restarts(mut self, restarts_per_worker: usize) -> Self {
        self.restarts_per_worker = restarts_per_worker;
        self
    }

    pub fn with_max_sweeps(mut self, max_sweeps: usize) -> Self {
        self.max_sweeps = max_sweeps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_prune_threshold(mut self, threshold: f64) -> Self {
        self.prune_threshold = threshold;
        self
    }
}

/// Counters summed over all workers of one decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GreedyStats {
    pub restarts: usize,
    /// Restarts abandoned because their sample was already explored.
    pub duplicates: usize,
    /// Restarts whose sample came back empty.
    pub no_parse: usize,
    pub sweeps: usize,
    pub moves_evaluated: usize,
    pub improvements: usize,
}

impl AddAssign<&GreedyStats> for GreedyStats {
    fn add_assign(&mut self, other: &GreedyStats) {
        self.restarts += other.restarts;
        self.duplicates += other.duplicates;
        self.no_parse += other.no_parse;
        self.sweeps += other.sweeps;
        self.moves_evaluated += other.moves_evaluated;
        self.improvements += other.improvements;
    }
}

/// Result of one hill climb, with the score after every sweep.
#[derive(Debug, Clone)]
pub(crate) struct Climb {
    pub(crate) derivation: Derivation,
    pub(crate) trace: Vec<f64>,
}

/// Sample-then-hill-climb decoder.
#[derive(Clone, Debug)]
pub struct RandomizedGreedy {
    grammar: Arc<Grammar>,
    config: GreedyConfig,
    second_order: bool,
    cost: Option<CostAugmenter>,
    /// Worker pool, built on first use and shared by clones.
    pool: OnceLock<Arc<ThreadPool>>,
}

impl RandomizedGreedy {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        Self::with_config(grammar, GreedyConfig::default())
    }

    pub fn with_config(grammar: Arc<Grammar>, config: GreedyConfig) -> Self {
        RandomizedGreedy {
            grammar,
            config,
            second_order: false,
            cost: None,
            pool: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &GreedyConfig {
        &self.config
    }

    pub fn set_cost_augmenter(&mut self, cost: Option<CostAugmenter>) {
        self.cost = cost;
    }

    pub(crate) fn pool(&self) -> Result<Arc<ThreadPool>, DecodeError> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool.clone());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .thread_name(|i| format!("greedy-{}", i))
            .build()
            .map_err(|e| DecodeError::WorkerPool(e.to_string()))?;
        // A racing caller may have won; use whichever pool was stored.
        let _ = self.pool.set(Arc::new(pool));
        self.pool
            .get()
            .cloned()
            .ok_or_else(|| DecodeError::WorkerPool("pool not initialised".to_string()))
    }

    /// Decode and report search counters.
    pub fn decode_with_stats(
        &self,
        sentence: &Sentence,
        model: &dyn ScoringModel,
    ) -> Result<(Option<Derivation>, GreedyStats), DecodeError> {
        if sentence.is_empty() {
            return Ok((None, GreedyStats::default()));
        }

        let mut sampler = InsideSampler::new(self.grammar.clone()).with_threshold(self.config.prune_threshold);
        sampler.set_cost_augmenter(self.cost.clone());
        let chart = sampler.calculate_probabilities(sentence, model)?;
        if chart.is_empty() {
            debug!("greedy: no parse for sentence of {} words", sentence.len());
            return Ok((None, GreedyStats::default()));
        }

        let workers = self.config.workers.max(1);
        let pool = self.pool()?;
        let seen: DashSet<Vec<Span>> = DashSet::new();

        let outcomes: Vec<Result<(Option<Derivation>, GreedyStats), DecodeError>> = pool.install(|| {
            (0..workers)
                .into_par_iter()
                .map(|worker| self.run_worker(worker, &chart, sentence, model, &seen))
                .collect()
        });

        let mut best: Option<Derivation> = None;
        let mut stats = GreedyStats::default();
        for outcome in outcomes {
            let (found, worker_stats) = outcome?;
            stats += &worker_stats;
            if let Some(found) = found {
                if best.as_ref().map_or(true, |b| found.score > b.score) {
                    best = Some(found);
                }
            }
        }

        debug!(
            "greedy: {} words, best {:?}, {} explored, {:?}",
            sentence.len(),
            best.as_ref().map(|d| d.score),
            seen.len(),
            stats
        );
        Ok((best, stats))
    }

    fn run_worker(
        &self,
        worker: usize,
        chart: &InsideChart,
        sentence: &Sentence,
        model: &dyn ScoringModel,
        seen: &DashSet<Vec<Span>>,
    ) -> Result<(Option<Derivation>, GreedyStats), DecodeError> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker as u64)),
            None => StdRng::from_entropy(),
        };
        let mut stats = GreedyStats::default();
        let mut best: Option<Derivation> = None;

        for restart in 0..self.config.restarts_per_worker {
            stats.restarts += 1;
            let Some(sample) = chart.sample(&mut rng)? else {
                stats.no_parse += 1;
                continue;
            };
            if !seen.insert(canonical(&sample)) {
                stats.duplicates += 1;
                continue;
            }

            let climb = self.hill_climb(&sample, sentence, model, &mut stats)?;
            trace!(
                "worker {} restart {}: {} sweeps, score {:.4}",
                worker,
                restart,
                climb.trace.len(),
                climb.derivation.score
            );
            if best.as_ref().map_or(true, |b| climb.derivation.score > b.score) {
                best = Some(climb.derivation);
            }
        }
        Ok((best, stats))
    }

    /// Climb from `spans` to a local optimum.
    pub(crate) fn hill_climb(
        &self,
        spans: &[Span],
        sentence: &Sentence,
        model: &dyn ScoringModel,
        stats: &mut GreedyStats,
    ) -> Result<Climb, DecodeError> {
        let grammar = &*self.grammar;
        let n = sentence.len();
        let mut tree = ParseTree::from_spans(spans, n)?;
        let mut current = tree.to_spans();
        let mut score = self.score(sentence, model, &current)?;
        let mut trace = Vec::new();

        for _ in 0..self.config.max_sweeps {
            stats.sweeps += 1;
            let mut improved = false;

            // Moves keep the node count, so positions stay valid while the
            // traversal is rebuilt after each adopted move.
            let mut position = 0;
            while let Some(&at) = tree.preorder().get(position) {
                let mut best: Option<(Alternative, f64)> = None;
                for alternative in tree.alternatives(at, grammar, sentence) {
                    stats.moves_evaluated += 1;
                    let candidate = self.score(sentence, model, &alternative)?;
                    if candidate > best.as_ref().map_or(score, |(_, s)| *s) {
                        best = Some((alternative, candidate));
                    }
                }
                if let Some((alternative, candidate)) = best {
                    tree = ParseTree::from_spans(&alternative.spans, n)?;
                    current = alternative;
                    score = candidate;
                    improved = true;
                    stats.improvements += 1;
                }
                position += 1;
            }

            trace.push(score);
            if !improved {
                break;
            }
        }

        Ok(Climb {
            derivation: Derivation::new(current.spans, score),
            trace,
        })
    }

    fn score(&self, sentence: &Sentence, model: &dyn ScoringModel, alternative: &Alternative) -> Result<f64, DecodeError> {
        score_with_parents(
            &self.grammar,
            sentence,
            model,
            &alternative.spans,
            &alternative.parents,
            self.second_order,
            self.cost.as_ref(),
        )
    }
}

impl Decoder for RandomizedGreedy {
    fn decode(&self, sentence: &Sentence, model: &dyn ScoringModel) -> Result<Option<Derivation>, DecodeError> {
        self.decode_with_stats(sentence, model).map(|(derivation, _)| derivation)
    }

    fn set_cost_augmenting(&mut self, enabled: bool, gold: &[Span]) -> Result<(), DecodeError> {
        self.cost = enabled.then(|| CostAugmenter::new(gold));
        Ok(())
    }

    fn set_second_order(&mut self, enabled: bool) -> Result<(), DecodeError> {
        self.second_order = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cky::CkyDecoder;
    use crate::decoder::score_derivation;
    use crate::model::{Feature, LinearModel};
    use crate::rule::Rule;
    use crate::span::{check_well_formed, TreeError};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn grammar() -> Arc<Grammar> {
        let mut g = Grammar::new();
        g.add_binary_named("X", "X", "X").unwrap();
        g.add_binary_named("Y", "X", "X").unwrap();
        g.add_binary_named("X", "Y", "X").unwrap();
        g.add_terminal_named("X").unwrap();
        g.add_top_level_named("X").unwrap();
        for w in ["a", "b", "c", "d"] {
            g.add_word(w);
        }
        Arc::new(g)
    }

    fn model(g: &Grammar) -> LinearModel {
        let mut m = LinearModel::new();
        for (i, rule) in g.binary_rules().iter().enumerate() {
            let code = g.rule_code(rule).unwrap();
            for w in 0..4u32 {
                let weight = ((i * 7 + w as usize) as f64 * 1.3).cos() * 2.0;
                m.set(Feature::SplitWord { code, word: Some(w) }, weight);
            }
        }
        m
    }

    fn config() -> GreedyConfig {
        GreedyConfig::default().with_workers(2).with_restarts(6).with_seed(17)
    }

    #[test]
    fn test_finds_exact_optimum_on_small_input() {
        init_logger();
        let g = grammar();
        let m = model(&g);
        // Every tree over three words is one move away from every other.
        let sentence = g.sentence(&["a", "b", "c"]);
        let exact = CkyDecoder::new(g.clone()).decode(&sentence, &m).unwrap().unwrap();
        let (found, stats) = RandomizedGreedy::with_config(g.clone(), config())
            .decode_with_stats(&sentence, &m)
            .unwrap();
        let found = found.unwrap();
        check_well_formed(&found.spans, 3).unwrap();
        assert!((found.score - exact.score).abs() < 1e-9);
        assert_eq!(stats.restarts, 12);
    }

    #[test]
    fn test_hill_climb_is_monotone() {
        let g = grammar();
        let m = model(&g);
        let sentence = g.sentence(&["a", "b", "c", "d"]);
        let x = g.label("X").unwrap();
        let start = vec![
            Span::binary(0, 3, 4, x, x, x),
            Span::binary(0, 2, 3, x, x, x),
            Span::binary(0, 1, 2, x, x, x),
            Span::terminal(0, x),
            Span::terminal(1, x),
            Span::terminal(2, x),
            Span::terminal(3, x),
        ];
        let initial = score_derivation(&g, &sentence, &m, &start, false, None).unwrap();
        let decoder = RandomizedGreedy::with_config(g.clone(), config().with_max_sweeps(5));
        let mut stats = GreedyStats::default();
        let climb = decoder.hill_climb(&start, &sentence, &m, &mut stats).unwrap();

        assert!(!climb.trace.is_empty() && climb.trace.len() <= 5);
        assert!(climb.trace[0] >= initial);
        assert!(climb.trace.windows(2).all(|w| w[1] >= w[0]));
        let rescored = score_derivation(&g, &sentence, &m, &climb.derivation.spans, false, None).unwrap();
        assert!((rescored - climb.derivation.score).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let g = grammar();
        let m = model(&g);
        let sentence = g.sentence(&["a", "b", "c", "d"]);
        let config = config().with_workers(1);
        let first = RandomizedGreedy::with_config(g.clone(), config.clone())
            .decode_with_stats(&sentence, &m)
            .unwrap();
        let second = RandomizedGreedy::with_config(g.clone(), config)
            .decode_with_stats(&sentence, &m)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_samples_are_skipped() {
        let mut g = Grammar::new();
        g.add_terminal_named("A").unwrap();
        g.add_top_level_named("A").unwrap();
        let g = Arc::new(g);
        let decoder = RandomizedGreedy::with_config(g.clone(), config().with_workers(1).with_restarts(5));
        let (found, stats) = decoder.decode_with_stats(&g.sentence(&["w"]), &LinearModel::new()).unwrap();
        assert!(found.is_some());
        assert_eq!(stats.restarts, 5);
        assert_eq!(stats.duplicates, 4);
    }

    #[test]
    fn test_second_order_scoring() {
        let g = grammar();
        let x = g.label("X").unwrap();
        let y = g.label("Y").unwrap();
        let sentence = g.sentence(&["a", "b", "c"]);
        let terminal = g.rule_code(&Rule::terminal(x)).unwrap();
        let mut m = LinearModel::new();
        m.set(Feature::Parent { code: terminal, parent: y }, 2.0);

        let mut decoder = RandomizedGreedy::with_config(g.clone(), config());
        let first = decoder.decode(&sentence, &m).unwrap().unwrap();
        assert_eq!(first.score, 0.0);

        decoder.set_second_order(true).unwrap();
        let second = decoder.decode(&sentence, &m).unwrap().unwrap();
        // X -> Y X with Y -> X X puts two terminals under a Y.
        assert_eq!(second.score, 4.0);
        let rescored = score_derivation(&g, &sentence, &m, &second.spans, true, None).unwrap();
        assert_eq!(rescored, second.score);
    }

    #[test]
    fn test_no_parse_and_toggles() {
        let mut g = Grammar::new();
        g.add_binary_named("S", "A", "A").unwrap();
        g.add_terminal_named("A").unwrap();
        g.add_top_level_named("S").unwrap();
        let g = Arc::new(g);
        let mut decoder = RandomizedGreedy::with_config(g.clone(), config());
        assert_eq!(decoder.decode(&g.sentence(&["w"]), &LinearModel::new()).unwrap(), None);
        assert_eq!(decoder.decode(&g.sentence::<&str>(&[]), &LinearModel::new()).unwrap(), None);
        assert!(decoder.set_cost_augmenting(true, &[]).is_ok());
        assert!(decoder.set_second_order(true).is_ok());
        assert!(decoder.decode(&g.sentence(&["w", "v"]), &LinearModel::new()).unwrap().is_some());
    }

    #[test]
    fn test_unknown_rule_aborts_climb() {
        let g = grammar();
        let x = g.label("X").unwrap();
        let y = g.label("Y").unwrap();
        // Neither `X -> Y Y` nor a terminal `Y` is in the grammar.
        let spans = vec![
            Span::binary(0, 1, 2, x, y, y),
            Span::terminal(0, y),
            Span::terminal(1, y),
        ];
        let sentence = g.sentence(&["a", "b"]);
        let decoder = RandomizedGreedy::with_config(g.clone(), config());
        let mut stats = GreedyStats::default();
        let result = decoder.hill_climb(&spans, &sentence, &model(&g), &mut stats);
        assert!(matches!(result, Err(DecodeError::UnknownRule(_))));
        assert_eq!(stats.improvements, 0);
    }

    #[test]
    fn test_two_roots_abort_climb() {
        let g = grammar();
        let x = g.label("X").unwrap();
        let spans = vec![Span::terminal(0, x), Span::terminal(1, x)];
        let sentence = g.sentence(&["a", "b"]);
        let decoder = RandomizedGreedy::with_config(g.clone(), config());
        let result = decoder.hill_climb(&spans, &sentence, &model(&g), &mut GreedyStats::default());
        assert!(matches!(
            result,
            Err(DecodeError::Malformed(TreeError::MultipleRoots(2)))
        ));
    }

    #[test]
    fn test_pool_is_reused_across_decodes() {
        let g = grammar();
        let m = model(&g);
        let decoder = RandomizedGreedy::with_config(g.clone(), config());
        let sentence = g.sentence(&["a", "b", "c"]);
        decoder.decode(&sentence, &m).unwrap();
        let first = decoder.pool().unwrap();
        decoder.decode(&sentence, &m).unwrap();
        assert!(Arc::ptr_eq(&first, &decoder.pool().unwrap()));
        assert_eq!(first.current_num_threads(), 2);

        let copy = decoder.clone();
        assert!(Arc::ptr_eq(&first, &copy.pool().unwrap()));
    }
}
