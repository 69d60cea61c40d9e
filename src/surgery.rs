//! Mutable parse trees and the local moves of greedy search.
//!
//! A derivation is loaded into an arena of nodes addressed by index. Each
//! node is one binary or terminal production, optionally topped by a single
//! unary edge (`unary_label -> label`). Edits are index rewrites in the
//! arena; every move produces a fresh whole-tree [`Alternative`] rather than
//! mutating the caller's tree.

use crate::grammar::Grammar;
use crate::intern::LabelId;
use crate::rule::Rule;
use crate::span::{canonical, check_well_formed, root_index, Sentence, Span, TreeError};

/// One constituent in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    /// Label of the binary or terminal production.
    pub label: LabelId,
    /// Label of a unary edge above the production, if any.
    pub unary_label: Option<LabelId>,
    pub start: usize,
    pub end: usize,
    pub parent: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Node {
    /// The label this constituent presents to its parent.
    pub fn outer_label(&self) -> LabelId {
        self.unary_label.unwrap_or(self.label)
    }
}

/// A whole candidate derivation with its parent links.
///
/// `parents[i]` is the index of span `i`'s parent, `None` for the root.
/// Spans are in pre-order.
#[derive(Clone, Debug, PartialEq)]
pub struct Alternative {
    pub spans: Vec<Span>,
    pub parents: Vec<Option<usize>>,
}

/// Arena-backed binary parse tree.
#[derive(Clone, Debug)]
pub struct ParseTree {
    nodes: Vec<Node>,
    root: usize,
}

impl ParseTree {
    /// Build a tree from a well-formed derivation over `len` words.
    ///
    /// Fails on malformed input and on a unary edge whose child is another
    /// unary edge.
    pub fn from_spans(spans: &[Span], len: usize) -> Result<Self, TreeError> {
        let parents = check_well_formed(spans, len)?;
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); spans.len()];
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                children[p].push(i);
            }
        }

        let mut node_of = vec![usize::MAX; spans.len()];
        let mut nodes = Vec::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            if !span.is_unary() {
                node_of[i] = nodes.len();
                nodes.push(Node {
                    label: span.label(),
                    unary_label: None,
                    start: span.start,
                    end: span.end,
                    parent: None,
                    left: None,
                    right: None,
                });
            }
        }

        for (i, span) in spans.iter().enumerate() {
            if !span.is_unary() {
                continue;
            }
            let &[child] = children[i].as_slice() else {
                return Err(missing_child(span));
            };
            if spans[child].is_unary() {
                return Err(TreeError::StackedUnary {
                    start: span.start,
                    end: span.end,
                });
            }
            node_of[i] = node_of[child];
            nodes[node_of[child]].unary_label = Some(span.label());
        }

        for (i, span) in spans.iter().enumerate() {
            if !span.is_binary() {
                continue;
            }
            let mut kids = children[i].clone();
            kids.sort_by_key(|&c| spans[c].start);
            let &[l, r] = kids.as_slice() else {
                return Err(missing_child(span));
            };
            let (at, left, right) = (node_of[i], node_of[l], node_of[r]);
            nodes[at].left = Some(left);
            nodes[at].right = Some(right);
            nodes[left].parent = Some(at);
            nodes[right].parent = Some(at);
        }

        let root = root_index(&parents).ok_or(TreeError::NoRoot)?;
        Ok(ParseTree {
            nodes,
            root: node_of[root],
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, at: usize) -> &Node {
        &self.nodes[at]
    }

    /// Nodes reachable from the root, parents before children, left before right.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(at) = stack.pop() {
            order.push(at);
            let node = &self.nodes[at];
            if let (Some(l), Some(r)) = (node.left, node.right) {
                stack.push(r);
                stack.push(l);
            }
        }
        order
    }

    /// Emit the tree as spans in pre-order with their parent indices.
    pub fn to_spans(&self) -> Alternative {
        let mut spans = Vec::with_capacity(2 * self.nodes.len());
        let mut parents = Vec::with_capacity(2 * self.nodes.len());
        let mut stack: Vec<(usize, Option<usize>)> = vec![(self.root, None)];

        while let Some((at, parent)) = stack.pop() {
            let node = &self.nodes[at];
            let mut attach = parent;
            if let Some(top) = node.unary_label {
                spans.push(Span::unary(node.start, node.end, top, node.label));
                parents.push(attach);
                attach = Some(spans.len() - 1);
            }
            let here = spans.len();
            match (node.left, node.right) {
                (Some(l), Some(r)) => {
                    let (left, right) = (&self.nodes[l], &self.nodes[r]);
                    spans.push(Span::binary(
                        node.start,
                        right.start,
                        node.end,
                        node.label,
                        left.outer_label(),
                        right.outer_label(),
                    ));
                    parents.push(attach);
                    stack.push((r, Some(here)));
                    stack.push((l, Some(here)));
                }
                _ => {
                    spans.push(Span::terminal(node.start, node.label));
                    parents.push(attach);
                }
            }
        }
        Alternative { spans, parents }
    }

    /// Every relabeling of `at` the grammar admits: a plain label, or a
    /// unary edge over a new production label. The root only takes
    /// top-level labels.
    pub fn relabel_alternatives(&self, at: usize, grammar: &Grammar, sentence: &Sentence) -> Vec<Alternative> {
        let current = (self.nodes[at].label, self.nodes[at].unary_label);
        let mut tree = self.clone();
        let mut out = Vec::new();
        for option in label_options(grammar, at == self.root) {
            if option == current {
                continue;
            }
            tree.nodes[at].label = option.0;
            tree.nodes[at].unary_label = option.1;
            let alternative = tree.to_spans();
            if admissible(grammar, sentence, &alternative) {
                out.push(alternative);
            }
        }
        out
    }

    /// Detach `at` and reinsert it next to every adjacent constituent under
    /// a new parent, trying every parent label. The root has no such moves.
    pub fn reattach_alternatives(&self, at: usize, grammar: &Grammar, sentence: &Sentence) -> Vec<Alternative> {
        let (start, end) = (self.nodes[at].start, self.nodes[at].end);
        let mut base = self.clone();
        if !base.detach(at) {
            return Vec::new();
        }

        let current = canonical(&self.to_spans().spans);
        let anchors: Vec<usize> = base
            .preorder()
            .into_iter()
            .filter(|&a| base.nodes[a].end == start || base.nodes[a].start == end)
            .collect();

        let mut out = Vec::new();
        for anchor in anchors {
            let mut tree = base.clone();
            let joined = tree.insert_sibling(anchor, at);
            for (label, unary_label) in label_options(grammar, tree.root == joined) {
                tree.nodes[joined].label = label;
                tree.nodes[joined].unary_label = unary_label;
                let alternative = tree.to_spans();
                if admissible(grammar, sentence, &alternative) && canonical(&alternative.spans) != current {
                    out.push(alternative);
                }
            }
        }
        out
    }

    /// Relabelings followed by reattachments of `at`.
    pub fn alternatives(&self, at: usize, grammar: &Grammar, sentence: &Sentence) -> Vec<Alternative> {
        let mut out = self.relabel_alternatives(at, grammar, sentence);
        out.extend(self.reattach_alternatives(at, grammar, sentence));
        out
    }

    /// Splice `at` out, promoting its sibling into the parent's place.
    fn detach(&mut self, at: usize) -> bool {
        let Some(parent) = self.nodes[at].parent else {
            return false;
        };
        let sibling = if self.nodes[parent].left == Some(at) {
            self.nodes[parent].right
        } else {
            self.nodes[parent].left
        };
        let Some(sibling) = sibling else {
            return false;
        };

        let grand = self.nodes[parent].parent;
        self.nodes[sibling].parent = grand;
        match grand {
            Some(g) => self.replace_child(g, parent, sibling),
            None => self.root = sibling,
        }
        self.nodes[at].parent = None;
        self.nodes[parent].parent = None;
        self.refresh_extents();
        true
    }

    /// Put `at` beside `anchor` under a new node, returning the new node.
    fn insert_sibling(&mut self, anchor: usize, at: usize) -> usize {
        let (left, right) = if self.nodes[anchor].end == self.nodes[at].start {
            (anchor, at)
        } else {
            (at, anchor)
        };
        let parent = self.nodes[anchor].parent;
        let joined = self.nodes.len();
        self.nodes.push(Node {
            label: self.nodes[anchor].label,
            unary_label: None,
            start: self.nodes[left].start,
            end: self.nodes[right].end,
            parent,
            left: Some(left),
            right: Some(right),
        });
        match parent {
            Some(g) => self.replace_child(g, anchor, joined),
            None => self.root = joined,
        }
        self.nodes[anchor].parent = Some(joined);
        self.nodes[at].parent = Some(joined);
        self.refresh_extents();
        joined
    }

    fn replace_child(&mut self, parent: usize, old: usize, new: usize) {
        let node = &mut self.nodes[parent];
        if node.left == Some(old) {
            node.left = Some(new);
        } else if node.right == Some(old) {
            node.right = Some(new);
        }
    }

    /// Recompute internal extents bottom-up from the leaves.
    fn refresh_extents(&mut self) {
        for at in self.preorder().into_iter().rev() {
            if let (Some(l), Some(r)) = (self.nodes[at].left, self.nodes[at].right) {
                self.nodes[at].start = self.nodes[l].start;
                self.nodes[at].end = self.nodes[r].end;
            }
        }
    }
}

fn missing_child(span: &Span) -> TreeError {
    TreeError::MissingChild {
        start: span.start,
        end: span.end,
        label: span.label(),
    }
}

/// `(label, unary_label)` pairs a node may take.
fn label_options(grammar: &Grammar, root: bool) -> Vec<(LabelId, Option<LabelId>)> {
    let plain = grammar.labels().ids().map(|l| (l, None));
    let unary = grammar.unary_rules().iter().filter_map(|rule| match *rule {
        Rule::Unary { parent, child } => Some((child, Some(parent))),
        _ => None,
    });
    plain
        .chain(unary)
        .filter(|&(label, unary_label)| !root || grammar.is_top_level(unary_label.unwrap_or(label)))
        .collect()
}

/// Whether every rule of `alternative` is in the grammar, every terminal
/// label may emit its word, and the root label is accepted.
pub fn admissible(grammar: &Grammar, sentence: &Sentence, alternative: &Alternative) -> bool {
    alternative
        .spans
        .iter()
        .zip(&alternative.parents)
        .all(|(span, parent)| {
            grammar.contains(&span.rule)
                && (!span.is_terminal()
                    || grammar
                        .terminal_labels_for(sentence.word_id(span.start))
                        .contains(&span.label()))
                && (parent.is_some() || grammar.is_top_level(span.label()))
        })
}
