//! Grammar: label and word enumerations plus dense rule tables.
//!
//! Binary and unary rules each get their own dense enumeration so the
//! decoders can iterate them by id. Terminal rules are identified by the
//! label that emits the word. The grammar also records which labels are
//! accepted at the root and an optional tag dictionary restricting which
//! terminal labels may emit a known word.

use crate::intern::{Enumeration, LabelId, LabelSet, WordId};
use crate::rule::{rule_code, unpack_rule_code, Rule, RuleCode, RuleId, RuleType, MAX_RULE_ID};
use crate::span::Sentence;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Errors raised while building a grammar.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GrammarError {
    #[error("label space exhausted")]
    TooManyLabels,
    #[error("too many {0} rules for a 16-bit rule id")]
    TooManyRules(RuleType),
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("unary rule {0} -> {0} rewrites a label to itself")]
    SelfUnary(String),
}

/// A context-free grammar over dense label ids.
#[derive(Clone, Debug, Default)]
pub struct Grammar {
    labels: LabelSet,
    words: Enumeration,

    binary: Vec<Rule>,
    binary_ids: FxHashMap<Rule, RuleId>,
    binary_by_parent: FxHashMap<LabelId, Vec<RuleId>>,

    unary: Vec<Rule>,
    unary_ids: FxHashMap<Rule, RuleId>,
    unary_by_parent: FxHashMap<LabelId, Vec<RuleId>>,
    /// Unary rule ids with every rule rewriting a label ahead of the rules
    /// that consume it.
    unary_order: Vec<RuleId>,

    terminal_labels: Vec<LabelId>,
    terminal_set: FxHashSet<LabelId>,

    top_level: Vec<LabelId>,
    top_level_set: FxHashSet<LabelId>,

    /// Tag dictionary: word -> terminal labels allowed to emit it.
    lexicon: FxHashMap<WordId, Vec<LabelId>>,
}

impl Grammar {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Enumerations
    // ------------------------------------------------------------------

    /// Add a label (idempotent).
    pub fn add_label(&mut self, name: &str) -> Result<LabelId, GrammarError> {
        self.labels.add(name).ok_or(GrammarError::TooManyLabels)
    }

    /// Add a word to the vocabulary (idempotent).
    pub fn add_word(&mut self, word: &str) -> WordId {
        self.words.add(word)
    }

    pub fn label(&self, name: &str) -> Option<LabelId> {
        self.labels.get(name)
    }

    pub fn word(&self, word: &str) -> Option<WordId> {
        self.words.get(word)
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn words(&self) -> &Enumeration {
        &self.words
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Map a tokenized sentence onto vocabulary ids.
    pub fn sentence<S: AsRef<str>>(&self, tokens: &[S]) -> Sentence {
        let tokens: Vec<String> = tokens.iter().map(|t| t.as_ref().to_string()).collect();
        let ids = tokens.iter().map(|t| self.words.get(t)).collect();
        Sentence::new(tokens, ids)
    }

    // ------------------------------------------------------------------
    // Rule construction
    // ------------------------------------------------------------------

    /// Add a binary rule `parent -> left right`, returning its dense id.
    pub fn add_binary(
        &mut self,
        parent: LabelId,
        left: LabelId,
        right: LabelId,
    ) -> Result<RuleId, GrammarError> {
        let rule = Rule::binary(parent, left, right);
        if let Some(&id) = self.binary_ids.get(&rule) {
            return Ok(id);
        }
        let id = self.binary.len() as RuleId;
        if id > MAX_RULE_ID {
            return Err(GrammarError::TooManyRules(RuleType::Binary));
        }
        self.binary.push(rule);
        self.binary_ids.insert(rule, id);
        self.binary_by_parent.entry(parent).or_default().push(id);
        Ok(id)
    }

    /// Add a unary rule `parent -> child`, returning its dense id.
    pub fn add_unary(&mut self, parent: LabelId, child: LabelId) -> Result<RuleId, GrammarError> {
        if parent == child {
            return Err(GrammarError::SelfUnary(self.labels.name(parent).to_string()));
        }
        let rule = Rule::unary(parent, child);
        if let Some(&id) = self.unary_ids.get(&rule) {
            return Ok(id);
        }
        let id = self.unary.len() as RuleId;
        if id > MAX_RULE_ID {
            return Err(GrammarError::TooManyRules(RuleType::Unary));
        }
        self.unary.push(rule);
        self.unary_ids.insert(rule, id);
        self.unary_by_parent.entry(parent).or_default().push(id);
        self.unary_order = self.bottom_up_unary_order();
        Ok(id)
    }

    /// Allow `label` to emit words.
    pub fn add_terminal(&mut self, label: LabelId) {
        if self.terminal_set.insert(label) {
            self.terminal_labels.push(label);
        }
    }

    /// Allow `label` to emit `word`, recording a tag dictionary entry.
    pub fn add_lexical(&mut self, label: LabelId, word: &str) -> WordId {
        self.add_terminal(label);
        let word = self.add_word(word);
        let entry = self.lexicon.entry(word).or_default();
        if !entry.contains(&label) {
            entry.push(label);
        }
        word
    }

    /// Accept `label` at the root of a derivation.
    pub fn add_top_level(&mut self, label: LabelId) {
        if self.top_level_set.insert(label) {
            self.top_level.push(label);
        }
    }

    /// Add `parent -> left right` by label name, creating labels as needed.
    pub fn add_binary_named(&mut self, parent: &str, left: &str, right: &str) -> Result<RuleId, GrammarError> {
        let p = self.add_label(parent)?;
        let l = self.add_label(left)?;
        let r = self.add_label(right)?;
        self.add_binary(p, l, r)
    }

    /// Add `parent -> child` by label name, creating labels as needed.
    pub fn add_unary_named(&mut self, parent: &str, child: &str) -> Result<RuleId, GrammarError> {
        let p = self.add_label(parent)?;
        let c = self.add_label(child)?;
        self.add_unary(p, c)
    }

    /// Add `label -> word` by name, creating the label as needed.
    pub fn add_lexical_named(&mut self, label: &str, word: &str) -> Result<WordId, GrammarError> {
        let l = self.add_label(label)?;
        Ok(self.add_lexical(l, word))
    }

    /// Mark an existing or new label as terminal by name.
    pub fn add_terminal_named(&mut self, label: &str) -> Result<LabelId, GrammarError> {
        let l = self.add_label(label)?;
        self.add_terminal(l);
        Ok(l)
    }

    /// Accept a label at the root by name, creating it as needed.
    pub fn add_top_level_named(&mut self, label: &str) -> Result<LabelId, GrammarError> {
        let l = self.add_label(label)?;
        self.add_top_level(l);
        Ok(l)
    }

    // ------------------------------------------------------------------
    // Rule lookup
    // ------------------------------------------------------------------

    pub fn binary_rules(&self) -> &[Rule] {
        &self.binary
    }

    pub fn unary_rules(&self) -> &[Rule] {
        &self.unary
    }

    pub fn binary_rule(&self, id: RuleId) -> Option<Rule> {
        self.binary.get(id as usize).copied()
    }

    pub fn unary_rule(&self, id: RuleId) -> Option<Rule> {
        self.unary.get(id as usize).copied()
    }

    /// Binary rules whose parent is `label`.
    pub fn binary_with_parent(&self, label: LabelId) -> &[RuleId] {
        self.binary_by_parent
            .get(&label)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Unary rules whose parent is `label`.
    pub fn unary_with_parent(&self, label: LabelId) -> &[RuleId] {
        self.unary_by_parent
            .get(&label)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn terminal_labels(&self) -> &[LabelId] {
        &self.terminal_labels
    }

    pub fn is_terminal(&self, label: LabelId) -> bool {
        self.terminal_set.contains(&label)
    }

    /// Terminal labels allowed to emit `word`. Words without tag dictionary
    /// entries (including out-of-vocabulary words) allow every terminal label.
    pub fn terminal_labels_for(&self, word: Option<WordId>) -> &[LabelId] {
        word.and_then(|w| self.lexicon.get(&w))
            .map(|v| v.as_slice())
            .unwrap_or(self.terminal_labels.as_slice())
    }

    pub fn top_level_labels(&self) -> &[LabelId] {
        &self.top_level
    }

    pub fn is_top_level(&self, label: LabelId) -> bool {
        self.top_level_set.contains(&label)
    }

    /// Dense id of a rule within its type, if the grammar contains it.
    pub fn rule_id(&self, rule: &Rule) -> Option<RuleId> {
        match rule {
            Rule::Terminal { parent } => self.is_terminal(*parent).then_some(*parent as RuleId),
            Rule::Unary { .. } => self.unary_ids.get(rule).copied(),
            Rule::Binary { .. } => self.binary_ids.get(rule).copied(),
        }
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rule_id(rule).is_some()
    }

    /// Packed scoring key of a rule, if the grammar contains it.
    pub fn rule_code(&self, rule: &Rule) -> Option<RuleCode> {
        self.rule_id(rule).map(|id| rule_code(rule.rule_type(), id))
    }

    /// Recover the rule a code was packed from.
    pub fn rule_from_code(&self, code: RuleCode) -> Option<Rule> {
        let (rule_type, id) = unpack_rule_code(code)?;
        match rule_type {
            RuleType::Terminal => {
                let label = LabelId::try_from(id).ok()?;
                self.is_terminal(label).then_some(Rule::terminal(label))
            }
            RuleType::Unary => self.unary_rule(id),
            RuleType::Binary => self.binary_rule(id),
        }
    }

    /// Render a rule with label names, e.g. `S -> NP VP`.
    pub fn describe(&self, rule: &Rule) -> String {
        let name = |l: LabelId| self.labels.name(l).to_string();
        match *rule {
            Rule::Terminal { parent } => format!("{} -> <word>", name(parent)),
            Rule::Unary { parent, child } => format!("{} -> {}", name(parent), name(child)),
            Rule::Binary {
                parent,
                left,
                right,
            } => format!("{} -> {} {}", name(parent), name(left), name(right)),
        }
    }

    /// Unary rule ids ordered child before parent: a rule `P -> C` comes
    /// after every rule whose parent is `C`, so one pass over this order
    /// closes a cell of an acyclic grammar. Insertion order if cyclic.
    pub fn unary_order(&self) -> &[RuleId] {
        &self.unary_order
    }

    /// Find a cycle in the unary-rule graph, returned as the labels along it.
    ///
    /// A grammar with `A -> B` and `B -> A` can rewrite a span forever
    /// without consuming input; the max-score decoders refuse such grammars.
    pub fn unary_cycle(&self) -> Option<Vec<LabelId>> {
        self.unary_dfs().err()
    }

    fn bottom_up_unary_order(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = (0..self.unary.len() as RuleId).collect();
        let Ok(finished) = self.unary_dfs() else {
            return ids;
        };
        let mut rank = vec![0usize; self.num_labels()];
        for (i, &label) in finished.iter().enumerate() {
            rank[label as usize] = i;
        }
        ids.sort_by_key(|&id| match self.unary[id as usize] {
            Rule::Unary { child, .. } => rank.get(child as usize).copied().unwrap_or(0),
            _ => 0,
        });
        ids
    }

    /// Depth-first search from parents to children over the unary rules.
    /// Returns labels in finishing order (children first), or the first
    /// cycle found.
    fn unary_dfs(&self) -> Result<Vec<LabelId>, Vec<LabelId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            Active,
            Done,
        }

        let n = self.num_labels();
        let mut children: Vec<Vec<LabelId>> = vec![Vec::new(); n];
        for rule in &self.unary {
            if let Rule::Unary { parent, child } = *rule {
                if (parent as usize) < n {
                    children[parent as usize].push(child);
                }
            }
        }

        let mut mark = vec![Mark::Unseen; n];
        let mut finished = Vec::with_capacity(n);
        for root in 0..n {
            if mark[root] != Mark::Unseen {
                continue;
            }
            // Iterative DFS; `path` mirrors the active stack.
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            let mut path: Vec<LabelId> = vec![root as LabelId];
            mark[root] = Mark::Active;

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                if let Some(&child) = children[node].get(next) {
                    top.1 += 1;
                    let c = child as usize;
                    if c >= n {
                        continue;
                    }
                    match mark[c] {
                        Mark::Active => {
                            let from = path.iter().position(|&l| l == child).unwrap_or(0);
                            let mut cycle = path[from..].to_vec();
                            cycle.push(child);
                            return Err(cycle);
                        }
                        Mark::Unseen => {
                            mark[c] = Mark::Active;
                            stack.push((c, 0));
                            path.push(child);
                        }
                        Mark::Done => {}
                    }
                } else {
                    mark[node] = Mark::Done;
                    finished.push(node as LabelId);
                    stack.pop();
                    path.pop();
                }
            }
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Grammar {
        let mut g = Grammar::new();
        g.add_binary_named("S", "NP", "VP").unwrap();
        g.add_binary_named("VP", "V", "NP").unwrap();
        g.add_unary_named("NP", "N").unwrap();
        g.add_lexical_named("N", "dogs").unwrap();
        g.add_lexical_named("V", "chase").unwrap();
        g.add_top_level_named("S").unwrap();
        g
    }

    #[test]
    fn test_dense_rule_ids() {
        let g = toy();
        let s = g.label("S").unwrap();
        let np = g.label("NP").unwrap();
        let vp = g.label("VP").unwrap();
        assert_eq!(g.binary_rules().len(), 2);
        assert_eq!(g.rule_id(&Rule::binary(s, np, vp)), Some(0));
        assert_eq!(g.binary_with_parent(s), &[0]);
        assert_eq!(g.unary_rules().len(), 1);
        assert!(g.is_top_level(s));
        assert!(!g.is_top_level(np));
    }

    #[test]
    fn test_re_adding_rule_is_noop() {
        let mut g = toy();
        let before = g.binary_rules().len();
        let id = g.add_binary_named("S", "NP", "VP").unwrap();
        assert_eq!(id, 0);
        assert_eq!(g.binary_rules().len(), before);
    }

    #[test]
    fn test_rule_code_round_trip() {
        let g = toy();
        for rule in g.binary_rules().iter().chain(g.unary_rules()) {
            let code = g.rule_code(rule).unwrap();
            assert_eq!(g.rule_from_code(code), Some(*rule));
        }
        let n = g.label("N").unwrap();
        let code = g.rule_code(&Rule::terminal(n)).unwrap();
        assert_eq!(g.rule_from_code(code), Some(Rule::terminal(n)));

        let s = g.label("S").unwrap();
        assert_eq!(g.rule_code(&Rule::terminal(s)), None);
    }

    #[test]
    fn test_tag_dictionary() {
        let mut g = toy();
        let n = g.label("N").unwrap();
        let v = g.label("V").unwrap();
        let dogs = g.word("dogs");
        assert_eq!(g.terminal_labels_for(dogs), &[n]);
        // Unknown words may be emitted by any terminal label.
        assert_eq!(g.terminal_labels_for(None), &[n, v]);
        g.add_lexical(v, "dogs");
        assert_eq!(g.terminal_labels_for(dogs), &[n, v]);
    }

    #[test]
    fn test_self_unary_rejected() {
        let mut g = Grammar::new();
        assert!(matches!(g.add_unary_named("A", "A"), Err(GrammarError::SelfUnary(_))));
    }

    #[test]
    fn test_unary_cycle_detection() {
        let mut g = toy();
        assert_eq!(g.unary_cycle(), None);

        g.add_unary_named("A", "B").unwrap();
        g.add_unary_named("B", "C").unwrap();
        assert_eq!(g.unary_cycle(), None);

        g.add_unary_named("C", "A").unwrap();
        let cycle = g.unary_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_unary_order_is_bottom_up() {
        let mut g = Grammar::new();
        // Added top-down, so insertion order is the worst order for closure.
        for i in (1..=5).rev() {
            g.add_unary_named(&format!("L{}", i), &format!("L{}", i - 1)).unwrap();
        }
        let order: Vec<String> = g
            .unary_order()
            .iter()
            .filter_map(|&id| g.unary_rule(id))
            .map(|rule| g.describe(&rule))
            .collect();
        assert_eq!(order, vec!["L1 -> L0", "L2 -> L1", "L3 -> L2", "L4 -> L3", "L5 -> L4"]);

        // A cycle falls back to insertion order.
        g.add_unary_named("L0", "L5").unwrap();
        assert_eq!(g.unary_order(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sentence_ids() {
        let g = toy();
        let sentence = g.sentence(&["dogs", "bark"]);
        assert_eq!(sentence.len(), 2);
        assert_eq!(sentence.word_id(0), g.word("dogs"));
        assert_eq!(sentence.word_id(1), None);
    }
}
