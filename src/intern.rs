//! Dense string enumerations for labels and words.
//!
//! Every label and word the grammar knows about is mapped to a dense integer
//! id, assigned in first-seen order, so charts can be indexed by plain arrays
//! instead of hash lookups.

use rustc_hash::FxHashMap;
use std::fmt;

/// Dense id of a syntactic label (nonterminal or part-of-speech tag).
pub type LabelId = u16;

/// Dense id of a vocabulary word.
pub type WordId = u32;

/// Bijective mapping between strings and dense ids.
///
/// Ids are assigned in first-seen order and never reused. Adding a string
/// that is already present is a no-op returning the existing id.
#[derive(Clone, Debug, Default)]
pub struct Enumeration {
    str_to_id: FxHashMap<Box<str>, u32>,
    id_to_str: Vec<Box<str>>,
}

impl Enumeration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string, returning its id (existing or fresh).
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.str_to_id.get(s) {
            return id;
        }

        let id = self.id_to_str.len() as u32;
        let boxed: Box<str> = s.into();
        self.str_to_id.insert(boxed.clone(), id);
        self.id_to_str.push(boxed);
        id
    }

    /// Look up the id of a string without adding it.
    pub fn get(&self, s: &str) -> Option<u32> {
        self.str_to_id.get(s).copied()
    }

    /// Look up the string for an id.
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    /// Iterate `(id, string)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, s.as_ref()))
    }
}

/// Enumeration of labels, with ids narrowed to [`LabelId`].
#[derive(Clone, Debug, Default)]
pub struct LabelSet {
    inner: Enumeration,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label. Returns `None` once the label space is exhausted.
    pub fn add(&mut self, label: &str) -> Option<LabelId> {
        if let Some(id) = self.inner.get(label) {
            return Some(id as LabelId);
        }
        if self.inner.len() > LabelId::MAX as usize {
            return None;
        }
        Some(self.inner.add(label) as LabelId)
    }

    pub fn get(&self, label: &str) -> Option<LabelId> {
        self.inner.get(label).map(|id| id as LabelId)
    }

    pub fn resolve(&self, id: LabelId) -> Option<&str> {
        self.inner.resolve(id as u32)
    }

    /// Label name, or a placeholder for ids outside the enumeration.
    pub fn name(&self, id: LabelId) -> LabelName<'_> {
        LabelName(self.resolve(id), id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = LabelId> {
        (0..self.inner.len()).map(|i| i as LabelId)
    }
}

/// Display adapter returned by [`LabelSet::name`].
pub struct LabelName<'a>(Option<&'a str>, LabelId);

impl fmt::Display for LabelName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "#{}", self.1),
        }
    }
}
