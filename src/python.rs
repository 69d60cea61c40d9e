//! Python bindings via PyO3.

use crate::cky::CkyDecoder;
use crate::decoder::{DecodeError, Decoder, Derivation, PRUNE_THRESHOLD};
use crate::grammar::Grammar;
use crate::intern::LabelId;
use crate::greedy::{GreedyConfig, RandomizedGreedy};
use crate::model::{Feature, LinearModel};
use crate::parser::parse_grammar;
use crate::pruned::PrunedDecoder;
use crate::rule::Rule;
use crate::span::Sentence;
use pyo3::exceptions::{PyNotImplementedError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::sync::Arc;

fn decode_err(err: DecodeError) -> PyErr {
    match err {
        DecodeError::Unsupported { .. } => PyNotImplementedError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Python wrapper for Grammar.
#[pyclass(name = "Grammar", unsendable)]
#[derive(Clone)]
struct PyGrammar {
    inner: Arc<Grammar>,
}

impl PyGrammar {
    fn label(&self, name: &str) -> PyResult<LabelId> {
        self.inner
            .label(name)
            .ok_or_else(|| PyValueError::new_err(format!("unknown label: {}", name)))
    }

    fn rule(&self, parent: &str, children: &[String]) -> PyResult<Rule> {
        let parent = self.label(parent)?;
        let rule = match children {
            [] => Rule::terminal(parent),
            [child] => Rule::unary(parent, self.label(child)?),
            [left, right] => Rule::binary(parent, self.label(left)?, self.label(right)?),
            _ => return Err(PyValueError::new_err("a rule has at most two children")),
        };
        if !self.inner.contains(&rule) {
            return Err(PyValueError::new_err(format!(
                "rule not in grammar: {}",
                self.inner.describe(&rule)
            )));
        }
        Ok(rule)
    }
}

#[pymethods]
impl PyGrammar {
    /// Parse a grammar description.
    #[staticmethod]
    fn from_text(text: &str) -> PyResult<Self> {
        let grammar = parse_grammar(text).map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(PyGrammar {
            inner: Arc::new(grammar),
        })
    }

    /// Label names in id order.
    fn labels(&self) -> Vec<String> {
        self.inner
            .labels()
            .ids()
            .map(|l| self.inner.labels().name(l).to_string())
            .collect()
    }

    fn num_labels(&self) -> usize {
        self.inner.num_labels()
    }

    fn num_rules(&self) -> (usize, usize, usize) {
        (
            self.inner.binary_rules().len(),
            self.inner.unary_rules().len(),
            self.inner.terminal_labels().len(),
        )
    }

    fn __repr__(&self) -> String {
        let (binary, unary, terminal) = self.num_rules();
        format!(
            "Grammar({} labels, {} binary, {} unary, {} terminal)",
            self.inner.num_labels(),
            binary,
            unary,
            terminal
        )
    }
}

/// Python wrapper for LinearModel.
#[pyclass(name = "LinearModel", unsendable)]
#[derive(Clone, Default)]
struct PyLinearModel {
    inner: LinearModel,
}

#[pymethods]
impl PyLinearModel {
    #[new]
    fn new() -> Self {
        PyLinearModel::default()
    }

    /// Set the weight of a rule, named by its parent and child labels.
    fn set_rule(&mut self, grammar: &PyGrammar, parent: &str, children: Vec<String>, weight: f64) -> PyResult<()> {
        let rule = grammar.rule(parent, &children)?;
        let code = grammar
            .inner
            .rule_code(&rule)
            .ok_or_else(|| PyValueError::new_err("rule has no code"))?;
        self.inner.set(Feature::Rule(code), weight);
        Ok(())
    }

    /// Set the weight of terminal `label` emitting `word`.
    fn set_emit(&mut self, grammar: &PyGrammar, label: &str, word: &str, weight: f64) -> PyResult<()> {
        let rule = grammar.rule(label, &[])?;
        let code = grammar
            .inner
            .rule_code(&rule)
            .ok_or_else(|| PyValueError::new_err("rule has no code"))?;
        self.inner.set(
            Feature::Emit {
                code,
                word: grammar.inner.word(word),
            },
            weight,
        );
        Ok(())
    }

    fn __len__(&self) -> usize {
        self.inner.len()
    }
}

/// Python wrapper over the decoders.
#[pyclass(name = "Decoder", unsendable)]
struct PyDecoder {
    grammar: Arc<Grammar>,
    inner: Box<dyn Decoder>,
}

impl PyDecoder {
    fn run(&self, model: &PyLinearModel, words: &[String]) -> PyResult<(Sentence, Option<Derivation>)> {
        let sentence = self.grammar.sentence(words);
        let derivation = self.inner.decode(&sentence, &model.inner).map_err(decode_err)?;
        Ok((sentence, derivation))
    }
}

#[pymethods]
impl PyDecoder {
    /// Exact CKY decoder.
    #[staticmethod]
    fn cky(grammar: &PyGrammar) -> Self {
        PyDecoder {
            grammar: grammar.inner.clone(),
            inner: Box::new(CkyDecoder::new(grammar.inner.clone())),
        }
    }

    /// Beam-pruned CKY decoder.
    #[staticmethod]
    #[pyo3(signature = (grammar, threshold = PRUNE_THRESHOLD))]
    fn pruned(grammar: &PyGrammar, threshold: f64) -> Self {
        PyDecoder {
            grammar: grammar.inner.clone(),
            inner: Box::new(PrunedDecoder::new(grammar.inner.clone()).with_threshold(threshold)),
        }
    }

    /// Randomized-greedy decoder.
    #[staticmethod]
    #[pyo3(signature = (grammar, workers = 4, restarts = 8, seed = None))]
    fn greedy(grammar: &PyGrammar, workers: usize, restarts: usize, seed: Option<u64>) -> Self {
        let mut config = GreedyConfig::default().with_workers(workers).with_restarts(restarts);
        config.seed = seed;
        PyDecoder {
            grammar: grammar.inner.clone(),
            inner: Box::new(RandomizedGreedy::with_config(grammar.inner.clone(), config)),
        }
    }

    /// Best tree as `(label, start, end)` triples in pre-order, or `None`
    /// when the sentence has no parse.
    fn decode(&self, model: &PyLinearModel, words: Vec<String>) -> PyResult<Option<Vec<(String, usize, usize)>>> {
        let (_, derivation) = self.run(model, &words)?;
        Ok(derivation.map(|d| {
            d.spans
                .iter()
                .map(|s| (self.grammar.labels().name(s.label()).to_string(), s.start, s.end))
                .collect()
        }))
    }

    /// Best tree as a bracketed string, or `None`.
    fn bracketed(&self, model: &PyLinearModel, words: Vec<String>) -> PyResult<Option<String>> {
        let (sentence, derivation) = self.run(model, &words)?;
        derivation
            .map(|d| d.to_bracketed(&self.grammar, &sentence))
            .transpose()
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    fn set_second_order(&mut self, enabled: bool) -> PyResult<()> {
        self.inner.set_second_order(enabled).map_err(decode_err)
    }
}

/// Python module definition.
#[pymodule]
fn span_chart(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyGrammar>()?;
    m.add_class::<PyLinearModel>()?;
    m.add_class::<PyDecoder>()?;
    m.add("PRUNE_THRESHOLD", PRUNE_THRESHOLD)?;
    Ok(())
}
