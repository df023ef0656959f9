//! Nearest-neighbour identity resolution over a roster snapshot.

use crate::types::{Embedding, PrincipalId, RosterEntry};

/// Distance assigned to pairs that cannot be compared.
const DEGENERATE_DISTANCE: f64 = 1.0;

/// Cosine distance `1 - cos(a, b)` accumulated in f64.
///
/// Mismatched dimensions, empty or zero-magnitude vectors and non-finite
/// components all yield 1.0 instead of an error or NaN.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    comparable_distance(a, b).unwrap_or(DEGENERATE_DISTANCE)
}

fn comparable_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !(denom > 0.0) || !denom.is_finite() || !dot.is_finite() {
        return None;
    }
    Some((1.0 - dot / denom).clamp(0.0, 2.0))
}

/// Outcome of resolving a probe against a roster.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched {
        principal: PrincipalId,
        distance: f64,
    },
    /// Nobody within threshold. `best_distance` is `None` for an empty roster.
    NoMatch { best_distance: Option<f64> },
}

impl Resolution {
    pub fn principal(&self) -> Option<PrincipalId> {
        match self {
            Resolution::Matched { principal, .. } => Some(*principal),
            Resolution::NoMatch { .. } => None,
        }
    }
}

/// Strategy for matching a probe embedding against enrolled references.
pub trait Matcher {
    fn resolve(&self, probe: &Embedding, roster: &[RosterEntry], threshold: f64) -> Resolution;
}

/// Minimum cosine distance matcher.
///
/// Walks every roster entry with no early exit. Ties keep the earliest
/// entry, so the result depends only on roster order, never on scores
/// computed later.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn resolve(&self, probe: &Embedding, roster: &[RosterEntry], threshold: f64) -> Resolution {
        let mut best: Option<(usize, f64, bool)> = None;

        for (i, entry) in roster.iter().enumerate() {
            let (distance, comparable) = match comparable_distance(&probe.values, &entry.embedding.values) {
                Some(d) => (d, true),
                None => (DEGENERATE_DISTANCE, false),
            };
            let is_better = match best {
                None => true,
                Some((_, best_distance, _)) => distance < best_distance,
            };
            if is_better {
                best = Some((i, distance, comparable));
            }
        }

        match best {
            Some((idx, distance, true)) if distance < threshold => Resolution::Matched {
                principal: roster[idx].principal,
                distance,
            },
            Some((_, distance, _)) => Resolution::NoMatch {
                best_distance: Some(distance),
            },
            None => Resolution::NoMatch {
                best_distance: None,
            },
        }
    }
}
