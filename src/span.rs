//! Spans: the edges of a derivation.
//!
//! A derivation is a flat list of spans. Parent links are not stored; they
//! are recovered geometrically: a span's parent is the span whose rule has a
//! child slot with exactly this span's `(start, end, label)`.

use crate::intern::{LabelId, WordId};
use crate::rule::{ChildLabels, Rule};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Structural problems with a derivation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TreeError {
    #[error("derivation has no spans")]
    Empty,
    #[error("derivation has no top-level span")]
    NoRoot,
    #[error("derivation has {0} top-level spans")]
    MultipleRoots(usize),
    #[error("no span fills child slot [{start}, {end}) label {label}")]
    MissingChild {
        start: usize,
        end: usize,
        label: LabelId,
    },
    #[error("span [{start}, {end}) split {split} has an invalid interval")]
    BadInterval {
        start: usize,
        end: usize,
        split: usize,
    },
    #[error("root span [{start}, {end}) does not cover a sentence of {len} words")]
    PartialCover { start: usize, end: usize, len: usize },
    #[error("stacked unary rules at [{start}, {end})")]
    StackedUnary { start: usize, end: usize },
}

/// A tokenized sentence with vocabulary ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sentence {
    tokens: Vec<String>,
    ids: Vec<Option<WordId>>,
}

impl Sentence {
    pub fn new(tokens: Vec<String>, ids: Vec<Option<WordId>>) -> Self {
        debug_assert_eq!(tokens.len(), ids.len());
        Sentence { tokens, ids }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, i: usize) -> Option<&str> {
        self.tokens.get(i).map(|s| s.as_str())
    }

    /// Vocabulary id of word `i`; `None` for unknown words or out of range.
    pub fn word_id(&self, i: usize) -> Option<WordId> {
        self.ids.get(i).copied().flatten()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

/// One edge of a derivation: a rule applied over `[start, end)`.
///
/// `split` is the absolute index where the right child of a binary rule
/// starts; other rule types set it to `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub split: usize,
    pub rule: Rule,
}

impl Span {
    pub fn terminal(position: usize, label: LabelId) -> Self {
        Span {
            start: position,
            end: position + 1,
            split: position,
            rule: Rule::terminal(label),
        }
    }

    pub fn unary(start: usize, end: usize, parent: LabelId, child: LabelId) -> Self {
        Span {
            start,
            end,
            split: start,
            rule: Rule::unary(parent, child),
        }
    }

    pub fn binary(start: usize, split: usize, end: usize, parent: LabelId, left: LabelId, right: LabelId) -> Self {
        Span {
            start,
            end,
            split,
            rule: Rule::binary(parent, left, right),
        }
    }

    /// The label this span produces.
    #[inline]
    pub fn label(&self) -> LabelId {
        self.rule.parent()
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.end - self.start
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.rule, Rule::Terminal { .. })
    }

    pub fn is_unary(&self) -> bool {
        matches!(self.rule, Rule::Unary { .. })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.rule, Rule::Binary { .. })
    }

    /// `(start, end, label)` slots this span's children must fill.
    pub fn child_slots(&self) -> Vec<(usize, usize, LabelId)> {
        match self.rule.children() {
            ChildLabels::None => Vec::new(),
            ChildLabels::One(child) => vec![(self.start, self.end, child)],
            ChildLabels::Two(left, right) => {
                vec![(self.start, self.split, left), (self.split, self.end, right)]
            }
        }
    }

    fn check_interval(&self) -> Result<(), TreeError> {
        let ok = match self.rule {
            Rule::Terminal { .. } => self.end == self.start + 1,
            Rule::Unary { .. } => self.start < self.end,
            Rule::Binary { .. } => self.start < self.split && self.split < self.end,
        };
        if ok {
            Ok(())
        } else {
            Err(TreeError::BadInterval {
                start: self.start,
                end: self.end,
                split: self.split,
            })
        }
    }
}

/// Recover parent links by geometric containment.
///
/// Entry `i` is the index of span `i`'s parent, or `None` for a top-level
/// span. Every child slot must be filled by exactly one span.
pub fn parent_map(spans: &[Span]) -> Result<Vec<Option<usize>>, TreeError> {
    let mut open: FxHashMap<(usize, usize, LabelId), Vec<usize>> = FxHashMap::default();
    for (i, span) in spans.iter().enumerate() {
        span.check_interval()?;
        for slot in span.child_slots() {
            open.entry(slot).or_default().push(i);
        }
    }

    let mut parents = vec![None; spans.len()];
    for (i, span) in spans.iter().enumerate() {
        let key = (span.start, span.end, span.label());
        if let Some(candidates) = open.get_mut(&key) {
            if let Some(pos) = candidates.iter().position(|&p| p != i) {
                parents[i] = Some(candidates.swap_remove(pos));
            }
        }
    }

    if let Some((&(start, end, label), _)) = open.iter().find(|(_, waiting)| !waiting.is_empty()) {
        return Err(TreeError::MissingChild { start, end, label });
    }
    Ok(parents)
}

/// Check that `spans` form exactly one tree covering `len` words.
///
/// Returns the parent map on success.
pub fn check_well_formed(spans: &[Span], len: usize) -> Result<Vec<Option<usize>>, TreeError> {
    if spans.is_empty() {
        return Err(TreeError::Empty);
    }
    let parents = parent_map(spans)?;
    let roots: Vec<usize> = (0..spans.len()).filter(|&i| parents[i].is_none()).collect();
    match roots.as_slice() {
        [] => Err(TreeError::NoRoot),
        [root] => {
            let span = &spans[*root];
            if span.start != 0 || span.end != len {
                return Err(TreeError::PartialCover {
                    start: span.start,
                    end: span.end,
                    len,
                });
            }
            Ok(parents)
        }
        many => Err(TreeError::MultipleRoots(many.len())),
    }
}

/// Index of the top-level span, if there is exactly one.
pub fn root_index(parents: &[Option<usize>]) -> Option<usize> {
    let mut roots = parents.iter().enumerate().filter(|(_, p)| p.is_none());
    let first = roots.next().map(|(i, _)| i);
    if roots.next().is_some() {
        return None;
    }
    first
}

/// Order-independent key of a span set.
pub fn canonical(spans: &[Span]) -> Vec<Span> {
    let mut key = spans.to_vec();
    key.sort_unstable();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    // Labels: 0=S 1=NP 2=VP 3=N 4=V
    fn small_tree() -> Vec<Span> {
        vec![
            Span::binary(0, 1, 2, 0, 1, 2),
            Span::unary(0, 1, 1, 3),
            Span::terminal(0, 3),
            Span::unary(1, 2, 2, 4),
            Span::terminal(1, 4),
        ]
    }

    #[test]
    fn test_child_slots() {
        let span = Span::binary(2, 4, 7, 0, 1, 2);
        assert_eq!(span.child_slots(), vec![(2, 4, 1), (4, 7, 2)]);
        assert_eq!(Span::unary(1, 3, 0, 5).child_slots(), vec![(1, 3, 5)]);
        assert!(Span::terminal(4, 3).child_slots().is_empty());
    }

    #[test]
    fn test_parent_map() {
        let spans = small_tree();
        let parents = parent_map(&spans).unwrap();
        assert_eq!(parents, vec![None, Some(0), Some(1), Some(0), Some(3)]);
        assert_eq!(root_index(&parents), Some(0));
    }

    #[test]
    fn test_parent_map_is_order_independent() {
        let mut spans = small_tree();
        spans.reverse();
        let parents = parent_map(&spans).unwrap();
        // Root is now last.
        assert_eq!(parents[4], None);
        assert_eq!(parents[0], Some(1));
        assert_eq!(parents[1], Some(4));
    }

    #[test]
    fn test_well_formed() {
        let spans = small_tree();
        assert!(check_well_formed(&spans, 2).is_ok());
        assert!(matches!(
            check_well_formed(&spans, 3),
            Err(TreeError::PartialCover { .. })
        ));
    }

    #[test]
    fn test_missing_child() {
        let mut spans = small_tree();
        spans.remove(2);
        assert_eq!(
            check_well_formed(&spans, 2),
            Err(TreeError::MissingChild {
                start: 0,
                end: 1,
                label: 3
            })
        );
    }

    #[test]
    fn test_multiple_roots() {
        let spans = vec![Span::terminal(0, 3), Span::terminal(1, 4)];
        assert_eq!(check_well_formed(&spans, 2), Err(TreeError::MultipleRoots(2)));
        assert_eq!(check_well_formed(&[], 0), Err(TreeError::Empty));
    }

    #[test]
    fn test_bad_interval() {
        let spans = vec![Span::binary(0, 0, 2, 0, 1, 2)];
        assert!(matches!(parent_map(&spans), Err(TreeError::BadInterval { .. })));
    }

    #[test]
    fn test_canonical_key() {
        let spans = small_tree();
        let mut shuffled = spans.clone();
        shuffled.swap(0, 3);
        shuffled.swap(1, 4);
        assert_eq!(canonical(&spans), canonical(&shuffled));
    }
}
