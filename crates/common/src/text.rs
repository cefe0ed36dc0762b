//! Text similarity for expected-vs-actual cross-checks
//!
//! Fuzzy-matches the text a test expected against the text the page actually
//! rendered. An exact match wins outright; substring containment scores 0.8;
//! anything else gets a blended word-overlap/character-overlap score held to
//! a 0.3 acceptance floor.

use std::collections::{HashMap, HashSet};

/// Minimum similarity for a candidate to be reported at all
pub const SIMILARITY_FLOOR: f64 = 0.3;

/// Containment score when one string contains the other
const CONTAINMENT_SCORE: f64 = 0.8;

/// Weights for the blended fallback score
const WORD_WEIGHT: f64 = 0.6;
const CHAR_WEIGHT: f64 = 0.4;

/// Find the page text most similar to `expected`, if any clears the floor.
pub fn find_similar_text(expected: &str, actual: &[String]) -> Option<(String, f64)> {
    let expected = expected.trim();
    if expected.is_empty() {
        return None;
    }

    let mut best: Option<(String, f64)> = None;
    for candidate in actual {
        let score = similarity(expected, candidate.trim());
        if (score - 1.0).abs() < f64::EPSILON {
            return Some((candidate.clone(), 1.0));
        }
        if score >= SIMILARITY_FLOOR
            && best.as_ref().map(|(_, b)| score > *b).unwrap_or(true)
        {
            best = Some((candidate.clone(), score));
        }
    }
    best
}

/// Similarity of two strings in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (la, lb) = (a.to_lowercase(), b.to_lowercase());
    if la == lb {
        return 1.0;
    }
    if !la.is_empty() && !lb.is_empty() && (la.contains(&lb) || lb.contains(&la)) {
        return CONTAINMENT_SCORE;
    }
    word_overlap(&la, &lb) * WORD_WEIGHT + char_overlap(&la, &lb) * CHAR_WEIGHT
}

/// Jaccard overlap of punctuation-stripped word sets
fn word_overlap(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
            })
            .filter(|w| !w.is_empty())
            .collect()
    };
    let (wa, wb) = (words(a), words(b));
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    intersection / union
}

/// Multiset character overlap, ignoring whitespace
fn char_overlap(a: &str, b: &str) -> f64 {
    let counts = |s: &str| -> HashMap<char, usize> {
        let mut m = HashMap::new();
        for c in s.chars().filter(|c| !c.is_whitespace()) {
            *m.entry(c).or_insert(0) += 1;
        }
        m
    };
    let (ca, cb) = (counts(a), counts(b));
    let total: usize = ca.values().sum::<usize>().max(cb.values().sum::<usize>());
    if total == 0 {
        return 0.0;
    }
    let shared: usize = ca
        .iter()
        .map(|(c, n)| n.min(cb.get(c).unwrap_or(&0)))
        .sum();
    shared as f64 / total as f64
}
