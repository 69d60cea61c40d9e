//! Decoder timings on a prepositional-attachment grammar.
//!
//! Run with: cargo bench --bench decode_bench

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use span_chart::{
    parse_grammar, CkyDecoder, Decoder, Feature, Grammar, GreedyConfig, InsideSampler, LinearModel,
    PrunedDecoder, RandomizedGreedy, Sentence,
};
use std::sync::Arc;

const GRAMMAR: &str = r#"
@top S
S  -> NP VP
NP -> Det N
NP -> NP PP
VP -> V NP
VP -> VP PP
PP -> P NP
NP -> N
Det -> "the"
N -> "man" "telescope" "hill"
V -> "saw"
P -> "with" "on"
"#;

fn build_grammar() -> Arc<Grammar> {
    match parse_grammar(GRAMMAR) {
        Ok(g) => Arc::new(g),
        Err(e) => panic!("bench grammar: {}", e),
    }
}

/// Small rule weights so ties are rare.
fn build_model(grammar: &Grammar) -> LinearModel {
    let mut model = LinearModel::new();
    let rules = grammar.binary_rules().iter().chain(grammar.unary_rules());
    for (i, rule) in rules.enumerate() {
        if let Some(code) = grammar.rule_code(rule) {
            model.set(Feature::Rule(code), 0.1 * ((i % 5) as f64) - 0.2);
        }
    }
    model
}

/// "the man saw the man with the telescope on the hill ..." padded to `n`.
fn build_sentence(grammar: &Grammar, n: usize) -> Sentence {
    let mut words = vec!["the", "man", "saw", "the", "man"];
    let tails = [["with", "the", "telescope"], ["on", "the", "hill"]];
    let mut k = 0;
    while words.len() + 3 <= n {
        words.extend_from_slice(&tails[k % 2]);
        k += 1;
    }
    words.truncate(n);
    grammar.sentence(&words)
}

fn time<F: FnMut()>(iterations: usize, mut f: F) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        f();
    }
    start.elapsed().as_secs_f64() / iterations as f64
}

fn main() {
    println!("=======================================================================");
    println!("Decoder Benchmark");
    println!("=======================================================================\n");

    let grammar = build_grammar();
    let model = build_model(&grammar);
    let cky = CkyDecoder::new(grammar.clone());
    let pruned = PrunedDecoder::new(grammar.clone());
    let sampler = InsideSampler::new(grammar.clone());
    let greedy = RandomizedGreedy::with_config(grammar.clone(), GreedyConfig::default().with_seed(7));

    let test_cases = [(5, 500), (8, 200), (11, 100), (14, 50), (17, 20), (20, 10)];

    println!(
        "{:>8} {:>12} {:>12} {:>12} {:>12} {:>10}",
        "Length", "CKY (ms)", "Pruned (ms)", "Inside (ms)", "Greedy (ms)", "Beam gap"
    );
    println!("{:-<8} {:-<12} {:-<12} {:-<12} {:-<12} {:-<10}", "", "", "", "", "", "");

    for (n, iterations) in test_cases {
        let sentence = build_sentence(&grammar, n);
        let exact = cky.decode(&sentence, &model).ok().flatten();
        let beam = pruned.decode(&sentence, &model).ok().flatten();
        let gap = match (&exact, &beam) {
            (Some(e), Some(b)) => e.score - b.score,
            _ => f64::NAN,
        };

        let cky_time = time(iterations, || {
            let _ = cky.decode(&sentence, &model);
        });
        let pruned_time = time(iterations, || {
            let _ = pruned.decode(&sentence, &model);
        });
        let mut rng = StdRng::seed_from_u64(1);
        let inside_time = time(iterations, || {
            if let Ok(chart) = sampler.calculate_probabilities(&sentence, &model) {
                let _ = chart.sample(&mut rng);
            }
        });
        let greedy_time = time(iterations.div_ceil(10), || {
            let _ = greedy.decode(&sentence, &model);
        });

        println!(
            "{:>8} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>10.4}",
            n,
            cky_time * 1000.0,
            pruned_time * 1000.0,
            inside_time * 1000.0,
            greedy_time * 1000.0,
            gap
        );
    }

    println!("\n=======================================================================");
}
