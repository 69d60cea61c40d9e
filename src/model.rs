//! The scoring-model boundary.
//!
//! Every search component scores a rule application through
//! [`ScoringModel`]: a rule code plus the local context (span boundaries,
//! split point and the sentence). [`LinearModel`] is a sparse linear model
//! over a small fixed feature set, with a deterministic dropout view used
//! during training.

use crate::intern::{LabelId, WordId};
use crate::rule::{unpack_rule_code, RuleCode, RuleType};
use crate::span::{Sentence, Span};
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};

/// Local context of one rule application.
#[derive(Clone, Copy, Debug)]
pub struct ScoreContext<'a> {
    pub sentence: &'a Sentence,
    pub start: usize,
    pub end: usize,
    /// Start of the right child for binary rules, `start` otherwise.
    pub split: usize,
}

impl<'a> ScoreContext<'a> {
    pub fn new(sentence: &'a Sentence, start: usize, end: usize, split: usize) -> Self {
        ScoreContext {
            sentence,
            start,
            end,
            split,
        }
    }

    pub fn for_span(sentence: &'a Sentence, span: &Span) -> Self {
        ScoreContext::new(sentence, span.start, span.end, span.split)
    }

    pub fn first_word(&self) -> Option<WordId> {
        self.sentence.word_id(self.start)
    }

    pub fn last_word(&self) -> Option<WordId> {
        self.sentence.word_id(self.end.saturating_sub(1))
    }

    pub fn split_word(&self) -> Option<WordId> {
        self.sentence.word_id(self.split)
    }
}

/// Scores rule applications. Implementations must be shareable across
/// worker threads.
pub trait ScoringModel: Sync {
    /// First-order score of rule `code` applied over `ctx`.
    fn score(&self, code: RuleCode, ctx: &ScoreContext<'_>) -> f64;

    /// Second-order score of rule `code` given its parent span's label.
    fn parent_score(&self, _code: RuleCode, _parent: LabelId, _ctx: &ScoreContext<'_>) -> f64 {
        0.0
    }
}

/// Features extracted by [`LinearModel`]. Unknown words are `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Rule(RuleCode),
    Emit { code: RuleCode, word: Option<WordId> },
    FirstWord { code: RuleCode, word: Option<WordId> },
    LastWord { code: RuleCode, word: Option<WordId> },
    SplitWord { code: RuleCode, word: Option<WordId> },
    Width { code: RuleCode, bucket: u8 },
    Parent { code: RuleCode, parent: LabelId },
}

/// Coarse span-width bucket.
pub fn width_bucket(width: usize) -> u8 {
    match width {
        0..=4 => width as u8,
        5..=7 => 5,
        8..=15 => 6,
        _ => 7,
    }
}

/// First-order features of rule `code` over `ctx`.
pub fn first_order_features(code: RuleCode, ctx: &ScoreContext<'_>) -> Vec<Feature> {
    let mut features = vec![Feature::Rule(code)];
    match unpack_rule_code(code).map(|(t, _)| t) {
        Some(RuleType::Terminal) => {
            features.push(Feature::Emit {
                code,
                word: ctx.first_word(),
            });
        }
        Some(RuleType::Unary) => {
            features.push(Feature::FirstWord {
                code,
                word: ctx.first_word(),
            });
            features.push(Feature::LastWord {
                code,
                word: ctx.last_word(),
            });
            features.push(Feature::Width {
                code,
                bucket: width_bucket(ctx.end - ctx.start),
            });
        }
        Some(RuleType::Binary) => {
            features.push(Feature::FirstWord {
                code,
                word: ctx.first_word(),
            });
            features.push(Feature::LastWord {
                code,
                word: ctx.last_word(),
            });
            features.push(Feature::SplitWord {
                code,
                word: ctx.split_word(),
            });
            features.push(Feature::Width {
                code,
                bucket: width_bucket(ctx.end - ctx.start),
            });
        }
        None => {}
    }
    features
}

/// Sparse linear model: the score of a rule application is the sum of the
/// weights of its features. Missing features weigh zero.
#[derive(Clone, Debug, Default)]
pub struct LinearModel {
    weights: FxHashMap<Feature, f64>,
}

impl LinearModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(&self, feature: &Feature) -> f64 {
        self.weights.get(feature).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, feature: Feature, weight: f64) {
        self.weights.insert(feature, weight);
    }

    /// Add `delta` to a feature weight (the update a trainer applies).
    pub fn update(&mut self, feature: Feature, delta: f64) {
        *self.weights.entry(feature).or_insert(0.0) += delta;
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Feature, &f64)> {
        self.weights.iter()
    }

    /// A view of this model with a deterministic subset of features zeroed.
    ///
    /// Each feature is dropped independently with probability `rate`,
    /// decided by hashing the feature with `seed`, so the same features stay
    /// dropped for the whole scoring pass.
    pub fn dropout(&self, rate: f64, seed: u64) -> Dropout<'_> {
        Dropout {
            model: self,
            rate: rate.clamp(0.0, 1.0),
            seed,
        }
    }

    fn sum(&self, features: &[Feature], keep: impl Fn(&Feature) -> bool) -> f64 {
        features
            .iter()
            .filter(|f| keep(f))
            .map(|f| self.weight(f))
            .sum()
    }
}

impl ScoringModel for LinearModel {
    fn score(&self, code: RuleCode, ctx: &ScoreContext<'_>) -> f64 {
        self.sum(&first_order_features(code, ctx), |_| true)
    }

    fn parent_score(&self, code: RuleCode, parent: LabelId, _ctx: &ScoreContext<'_>) -> f64 {
        self.weight(&Feature::Parent { code, parent })
    }
}

/// Dropout view over a [`LinearModel`], see [`LinearModel::dropout`].
#[derive(Clone, Copy, Debug)]
pub struct Dropout<'m> {
    model: &'m LinearModel,
    rate: f64,
    seed: u64,
}

impl Dropout<'_> {
    /// Whether `feature` is zeroed in this pass.
    pub fn is_dropped(&self, feature: &Feature) -> bool {
        if self.rate <= 0.0 {
            return false;
        }
        let mut hasher = FxHasher::default();
        self.seed.hash(&mut hasher);
        feature.hash(&mut hasher);
        let bits = mix64(hasher.finish()) >> 11;
        (bits as f64 / (1u64 << 53) as f64) < self.rate
    }
}

impl ScoringModel for Dropout<'_> {
    fn score(&self, code: RuleCode, ctx: &ScoreContext<'_>) -> f64 {
        self.model
            .sum(&first_order_features(code, ctx), |f| !self.is_dropped(f))
    }

    fn parent_score(&self, code: RuleCode, parent: LabelId, _ctx: &ScoreContext<'_>) -> f64 {
        let feature = Feature::Parent { code, parent };
        if self.is_dropped(&feature) {
            0.0
        } else {
            self.model.weight(&feature)
        }
    }
}

/// SplitMix64 finalizer.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::rule_code;

    fn sentence() -> Sentence {
        Sentence::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![Some(0), Some(1), None],
        )
    }

    #[test]
    fn test_terminal_features() {
        let s = sentence();
        let code = rule_code(RuleType::Terminal, 4);
        let ctx = ScoreContext::new(&s, 1, 2, 1);
        assert_eq!(
            first_order_features(code, &ctx),
            vec![Feature::Rule(code), Feature::Emit { code, word: Some(1) }]
        );
    }

    #[test]
    fn test_binary_features() {
        let s = sentence();
        let code = rule_code(RuleType::Binary, 0);
        let ctx = ScoreContext::new(&s, 0, 3, 1);
        let features = first_order_features(code, &ctx);
        assert_eq!(features.len(), 5);
        assert!(features.contains(&Feature::SplitWord { code, word: Some(1) }));
        assert!(features.contains(&Feature::LastWord { code, word: None }));
        assert!(features.contains(&Feature::Width { code, bucket: 3 }));
    }

    #[test]
    fn test_linear_score() {
        let s = sentence();
        let code = rule_code(RuleType::Terminal, 2);
        let mut model = LinearModel::new();
        model.set(Feature::Rule(code), 1.5);
        model.update(Feature::Emit { code, word: Some(0) }, 2.0);
        model.update(Feature::Emit { code, word: Some(0) }, 0.25);

        assert_eq!(model.score(code, &ScoreContext::new(&s, 0, 1, 0)), 3.75);
        assert_eq!(model.score(code, &ScoreContext::new(&s, 1, 2, 1)), 1.5);

        let binary = rule_code(RuleType::Binary, 0);
        model.set(Feature::Parent { code: binary, parent: 3 }, -0.5);
        let ctx = ScoreContext::new(&s, 0, 2, 1);
        assert_eq!(model.parent_score(binary, 3, &ctx), -0.5);
        assert_eq!(model.parent_score(binary, 4, &ctx), 0.0);
    }

    #[test]
    fn test_dropout_is_deterministic() {
        let mut model = LinearModel::new();
        for code in 0..200 {
            model.set(Feature::Rule(code), 1.0);
        }
        let a = model.dropout(0.5, 7);
        let b = model.dropout(0.5, 7);
        let dropped: Vec<bool> = (0..200).map(|c| a.is_dropped(&Feature::Rule(c))).collect();
        let again: Vec<bool> = (0..200).map(|c| b.is_dropped(&Feature::Rule(c))).collect();
        assert_eq!(dropped, again);

        let count = dropped.iter().filter(|&&d| d).count();
        assert!(count > 50 && count < 150, "dropped {} of 200", count);

        let none = model.dropout(0.0, 7);
        assert!((0..200).all(|c| !none.is_dropped(&Feature::Rule(c))));
        let all = model.dropout(1.0, 7);
        assert!((0..200).all(|c| all.is_dropped(&Feature::Rule(c))));
    }

    #[test]
    fn test_dropout_scores() {
        let s = sentence();
        let code = rule_code(RuleType::Terminal, 0);
        let mut model = LinearModel::new();
        model.set(Feature::Rule(code), 2.0);
        let ctx = ScoreContext::new(&s, 0, 1, 0);
        assert_eq!(model.dropout(1.0, 3).score(code, &ctx), 0.0);
        assert_eq!(model.dropout(0.0, 3).score(code, &ctx), 2.0);
    }

    #[test]
    fn test_width_buckets() {
        assert_eq!(width_bucket(1), 1);
        assert_eq!(width_bucket(6), 5);
        assert_eq!(width_bucket(9), 6);
        assert_eq!(width_bucket(40), 7);
    }
}
