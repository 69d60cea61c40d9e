//! Span-Chart: chart parsing and search over labeled binary constituency trees.
//!
//! This crate provides:
//! - Label, word and rule enumerations with packed rule codes
//! - A grammar with root labels, a tag dictionary and unary-cycle detection
//! - A line-based grammar description reader
//! - Dense `(start, end, label)` charts and pruning masks
//! - Exact and beam-pruned CKY decoders
//! - A log-space inside sampler
//! - Tree surgery and a parallel randomized-greedy decoder
//! - Python bindings via PyO3 (feature `python`)

pub mod chart;
pub mod cky;
pub mod decoder;
pub mod grammar;
pub mod greedy;
pub mod inside;
pub mod intern;
pub mod model;
pub mod parser;
pub mod pruned;
pub mod rule;
pub mod semiring;
pub mod span;
pub mod surgery;

#[cfg(feature = "python")]
mod python;


// Re-exports for convenience
pub use chart::{CellTable, Phase, PruningMask};
pub use cky::CkyDecoder;
pub use decoder::{
    score_derivation, CostAugmenter, DecodeError, Decoder, Derivation, DEFAULT_COST,
    MAX_UNARY_ITERATIONS, PRUNE_THRESHOLD,
};
pub use grammar::{Grammar, GrammarError};
pub use greedy::{GreedyConfig, GreedyStats, RandomizedGreedy};
pub use inside::{InsideChart, InsideSampler};
pub use intern::{LabelId, WordId};
pub use model::{Feature, LinearModel, ScoreContext, ScoringModel};
pub use parser::{parse_grammar, ParseError};
pub use pruned::{BeamStats, PrunedDecoder};
pub use rule::{Rule, RuleCode, RuleId, RuleType};
pub use semiring::{log_add, log_sum_exp, LogSum, MaxPlus, Semiring};
pub use span::{Sentence, Span, TreeError};
pub use surgery::{Alternative, ParseTree};
