use std::cmp::Ordering;

use serde::Serialize;

use crate::simulate::RunResult;

/// Result with the highest mean; the first one wins a tie.
pub fn pick_best(results: &[RunResult]) -> Option<&RunResult> {
    results.iter().fold(None, |best, r| match best {
        _ if r.mean.is_nan() => best,
        Some(b) if b.mean >= r.mean => Some(b),
        _ => Some(r),
    })
}

/// Results ordered for display, best first.
#[derive(Debug, Clone, Serialize)]
pub struct Ranking {
    pub best: RunResult,
    pub ranked: Vec<RunResult>,
}

/// Sorts by mean, descending and stable. `None` when there is nothing to rank.
pub fn rank(results: &[RunResult]) -> Option<Ranking> {
    let best = pick_best(results)?.clone();
    let mut ranked = results.to_vec();
    ranked.sort_by(|a, b| b.mean.partial_cmp(&a.mean).unwrap_or(Ordering::Equal));
    Some(Ranking { best, ranked })
}
