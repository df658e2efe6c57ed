use super::average_ranks;
use super::special::normal_sf;
use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

/// Largest number of non-zero differences for which the exact null distribution is used.
pub const EXACT_LIMIT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMethod {
    Exact,
    NormalApproximation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRank {
    /// min(W+, W-)
    pub statistic: f64,
    pub w_plus: f64,
    pub w_minus: f64,
    /// Non-zero differences used.
    pub n: usize,
    pub zero_differences: usize,
    pub p_value: f64,
    pub method: PValueMethod,
}

/// Two-sided Wilcoxon signed-rank test on the paired differences `x - y`.
///
/// Zero differences are dropped. Returns `Ok(None)` when every difference is
/// zero, since the statistic is undefined there.
pub fn signed_rank(x: &[f64], y: &[f64]) -> SimResult<Option<SignedRank>> {
    if x.len() != y.len() {
        return Err(SimError::MismatchedReplicationCount {
            expected: x.len(),
            found: y.len(),
        });
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(SimError::InvalidParameter(
            "signed-rank test needs finite values".to_string(),
        ));
    }

    let diffs: Vec<f64> = x
        .iter()
        .zip(y.iter())
        .map(|(a, b)| a - b)
        .filter(|d| *d != 0.0)
        .collect();
    let zero_differences = x.len() - diffs.len();
    let n = diffs.len();
    if n == 0 {
        return Ok(None);
    }

    let magnitudes: Vec<f64> = diffs.iter().map(|d| d.abs()).collect();
    let (ranks, ties) = average_ranks(&magnitudes);

    let mut w_plus = 0.0;
    let mut w_minus = 0.0;
    for (d, r) in diffs.iter().zip(ranks.iter()) {
        if *d > 0.0 {
            w_plus += r;
        } else {
            w_minus += r;
        }
    }
    let statistic = w_plus.min(w_minus);
    let has_ties = ties.iter().any(|&t| t > 1);

    let (p_value, method) = if n <= EXACT_LIMIT && !has_ties {
        (exact_p_value(statistic, n), PValueMethod::Exact)
    } else {
        let nf = n as f64;
        let mean = nf * (nf + 1.0) / 4.0;
        let tie_term: f64 = ties
            .iter()
            .map(|&t| {
                let t = t as f64;
                t * t * t - t
            })
            .sum::<f64>()
            / 48.0;
        let variance = nf * (nf + 1.0) * (2.0 * nf + 1.0) / 24.0 - tie_term;
        let z = (statistic - mean) / variance.sqrt();
        ((2.0 * normal_sf(z.abs())).min(1.0), PValueMethod::NormalApproximation)
    };

    Ok(Some(SignedRank {
        statistic,
        w_plus,
        w_minus,
        n,
        zero_differences,
        p_value,
        method,
    }))
}

/// 2 * P(T <= t) under the null, counting rank subsets by their sum.
fn exact_p_value(statistic: f64, n: usize) -> f64 {
    let max_sum = n * (n + 1) / 2;
    let mut counts = vec![0.0f64; max_sum + 1];
    counts[0] = 1.0;
    for rank in 1..=n {
        for sum in (rank..=max_sum).rev() {
            counts[sum] += counts[sum - rank];
        }
    }

    let threshold = statistic.floor() as usize;
    let tail: f64 = counts.iter().take(threshold + 1).sum();
    let total = 2f64.powi(n as i32);
    (2.0 * tail / total).min(1.0)
}
