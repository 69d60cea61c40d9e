//! Dense `(start, end, label)` tables for chart parsing.
//!
//! Cells are addressed by a half-open word interval; each cell holds one
//! slot per label. Storage is a single flat vector so the inner DP loops do
//! plain array indexing.

use crate::intern::LabelId;
use crate::semiring::Semiring;

/// A flat table with one value per `(start, end, label)`.
#[derive(Clone, Debug)]
pub struct CellTable<T> {
    n: usize,
    num_labels: usize,
    data: Vec<T>,
}

impl<T: Clone> CellTable<T> {
    /// Table for a sentence of `n` words, every slot set to `fill`.
    pub fn new(n: usize, num_labels: usize, fill: T) -> Self {
        CellTable {
            n,
            num_labels,
            data: vec![fill; (n + 1) * (n + 1) * num_labels],
        }
    }
}

impl<T> CellTable<T> {
    #[inline(always)]
    fn offset(&self, start: usize, end: usize) -> usize {
        debug_assert!(start < end && end <= self.n, "bad cell [{}, {})", start, end);
        (start * (self.n + 1) + end) * self.num_labels
    }

    pub fn sentence_len(&self) -> usize {
        self.n
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    #[inline(always)]
    pub fn get(&self, start: usize, end: usize, label: LabelId) -> &T {
        let at = self.offset(start, end) + label as usize;
        &self.data[at]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, start: usize, end: usize, label: LabelId) -> &mut T {
        let at = self.offset(start, end) + label as usize;
        &mut self.data[at]
    }

    #[inline(always)]
    pub fn set(&mut self, start: usize, end: usize, label: LabelId, value: T) {
        *self.get_mut(start, end, label) = value;
    }

    /// All label slots of one cell.
    pub fn cell(&self, start: usize, end: usize) -> &[T] {
        let at = self.offset(start, end);
        &self.data[at..at + self.num_labels]
    }
}

impl<S: Semiring> CellTable<S> {
    /// Add `value` into a slot with semiring addition, returning the new value.
    pub fn accumulate(&mut self, start: usize, end: usize, label: LabelId, value: S) -> S {
        let slot = self.get_mut(start, end, label);
        *slot = *slot + value;
        *slot
    }

    /// Best score in a cell, `-inf` when the cell is empty.
    pub fn cell_max(&self, start: usize, end: usize) -> f64 {
        self.cell(start, end)
            .iter()
            .map(|v| v.score())
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

impl CellTable<f64> {
    /// Best raw score in a cell, `-inf` when the cell is empty.
    pub fn cell_best(&self, start: usize, end: usize) -> f64 {
        self.cell(start, end)
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Which side of the unary closure a chart value belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Binary combinations and terminals only.
    BeforeUnary,
    /// After applying unary rules within the cell.
    AfterUnary,
}

/// Per-`(start, end, label)` beam filter, kept separately for the
/// before-unary and after-unary chart values.
///
/// Every slot starts pruned; the chart marks survivors live as it fills.
#[derive(Clone, Debug)]
pub struct PruningMask {
    before: CellTable<bool>,
    after: CellTable<bool>,
}

impl PruningMask {
    pub fn new(n: usize, num_labels: usize) -> Self {
        PruningMask {
            before: CellTable::new(n, num_labels, true),
            after: CellTable::new(n, num_labels, true),
        }
    }

    fn table(&self, phase: Phase) -> &CellTable<bool> {
        match phase {
            Phase::BeforeUnary => &self.before,
            Phase::AfterUnary => &self.after,
        }
    }

    fn table_mut(&mut self, phase: Phase) -> &mut CellTable<bool> {
        match phase {
            Phase::BeforeUnary => &mut self.before,
            Phase::AfterUnary => &mut self.after,
        }
    }

    #[inline(always)]
    pub fn is_pruned(&self, start: usize, end: usize, label: LabelId, phase: Phase) -> bool {
        *self.table(phase).get(start, end, label)
    }

    #[inline(always)]
    pub fn is_live(&self, start: usize, end: usize, label: LabelId, phase: Phase) -> bool {
        !self.is_pruned(start, end, label, phase)
    }

    pub fn set_pruned(&mut self, start: usize, end: usize, label: LabelId, phase: Phase, pruned: bool) {
        self.table_mut(phase).set(start, end, label, pruned);
    }

    /// Number of live labels in a cell.
    pub fn live_count(&self, start: usize, end: usize, phase: Phase) -> usize {
        self.table(phase).cell(start, end).iter().filter(|&&p| !p).count()
    }

    pub fn sentence_len(&self) -> usize {
        self.before.sentence_len()
    }
}
