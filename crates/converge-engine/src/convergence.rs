//! Convergence detection
//!
//! Similarity is the classic longest-matching-blocks ratio (Ratcliff/Obershelp):
//! find the longest common run, recurse on both sides, sum the run lengths `M`,
//! and report `2M / (|a| + |b|)`. The diff ratio is `1 - similarity`.
//!
//! The measure is purely structural. A one-character logic fix and a
//! one-character typo fix score the same.

use converge_core::{ConvergeError, Result};
use std::collections::HashMap;

/// Sequences at least this long drop "popular" characters from the index
const AUTOJUNK_MIN_LEN: usize = 200;

/// Longest-matching-blocks similarity over two character sequences
///
/// For `b` of 200+ characters, characters occurring in more than 1% of `b`
/// are left out of the match index, like `difflib`'s autojunk heuristic.
/// They still match when extending a block found through other characters.
pub struct SequenceMatcher<'a> {
    a: &'a [char],
    b: &'a [char],
    b2j: HashMap<char, Vec<usize>>,
}

impl<'a> SequenceMatcher<'a> {
    pub fn new(a: &'a [char], b: &'a [char]) -> Self {
        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, c) in b.iter().enumerate() {
            b2j.entry(*c).or_default().push(j);
        }

        let n = b.len();
        if n >= AUTOJUNK_MIN_LEN {
            let ntest = n / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= ntest);
        }

        Self { a, b, b2j }
    }

    /// Longest matching block in `a[alo..ahi]` x `b[blo..bhi]`
    ///
    /// Returns `(i, j, size)`; ties go to the earliest `i`, then earliest `j`.
    fn find_longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (a, b) = (self.a, self.b);
        let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0usize);

        // j2len[j] = length of the match ending at a[i-1], b[j]
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(&a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = if j > 0 {
                        j2len.get(&(j - 1)).copied().unwrap_or(0)
                    } else {
                        0
                    } + 1;
                    next.insert(j, k);
                    if k > bestsize {
                        besti = i + 1 - k;
                        bestj = j + 1 - k;
                        bestsize = k;
                    }
                }
            }
            j2len = next;
        }

        // Popular characters are not indexed; grow the block over them
        while besti > alo && bestj > blo && a[besti - 1] == b[bestj - 1] {
            besti -= 1;
            bestj -= 1;
            bestsize += 1;
        }
        while besti + bestsize < ahi && bestj + bestsize < bhi && a[besti + bestsize] == b[bestj + bestsize]
        {
            bestsize += 1;
        }

        (besti, bestj, bestsize)
    }

    /// Total length of all matching blocks
    pub fn matching_characters(&self) -> usize {
        let mut total = 0;
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];

        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, k) = self.find_longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            total += k;
            if alo < i && blo < j {
                queue.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                queue.push((i + k, ahi, j + k, bhi));
            }
        }

        total
    }

    /// Similarity in [0, 1]; two empty sequences are identical
    pub fn ratio(&self) -> f64 {
        let total = self.a.len() + self.b.len();
        if total == 0 {
            return 1.0;
        }
        2.0 * self.matching_characters() as f64 / total as f64
    }
}

/// Structural dissimilarity between two texts, in [0, 1]
pub fn diff_ratio(previous: &str, current: &str) -> f64 {
    if previous == current {
        return 0.0;
    }
    let a: Vec<char> = previous.chars().collect();
    let b: Vec<char> = current.chars().collect();
    (1.0 - SequenceMatcher::new(&a, &b).ratio()).clamp(0.0, 1.0)
}

/// Resolve the effective threshold; a percentage overrides the decimal value
pub fn resolve_threshold(decimal: f64, percent: Option<f64>) -> Result<f64> {
    let threshold = match percent {
        Some(p) => p / 100.0,
        None => decimal,
    };

    if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
        return Err(ConvergeError::Config(format!(
            "Threshold must be in (0, 1] (or (0, 100] as a percentage), got {}",
            threshold
        )));
    }
    Ok(threshold)
}

/// Outcome of comparing one new text against the previous one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub diff_ratio: f64,
    pub converged: bool,
}

/// Tracks the previous text and decides stop vs continue
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    threshold: f64,
    previous: String,
}

impl ConvergenceTracker {
    /// Start tracking from the initial content
    pub fn new(threshold: f64, initial: impl Into<String>) -> Self {
        Self {
            threshold,
            previous: initial.into(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare `current` with the previous text, then make it the new previous
    pub fn observe(&mut self, current: &str) -> Convergence {
        let ratio = diff_ratio(&self.previous, current);
        self.previous.clear();
        self.previous.push_str(current);

        Convergence {
            diff_ratio: ratio,
            converged: ratio < self.threshold,
        }
    }
}
