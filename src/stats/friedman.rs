use super::average_ranks;
use super::special::chi_square_sf;
use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriedmanChiSquare {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    /// Mean within-block rank of each treatment.
    pub mean_ranks: Vec<f64>,
    pub blocks: usize,
}

/// Friedman test for `k >= 3` treatments observed over the same blocks.
///
/// `samples[j][i]` is treatment `j` in block `i`. Returns `Ok(None)` when every
/// block is fully tied.
pub fn friedman_chi_square(samples: &[Vec<f64>]) -> SimResult<Option<FriedmanChiSquare>> {
    let k = samples.len();
    if k < 3 {
        return Err(SimError::InvalidParameter(format!(
            "Friedman test needs at least 3 samples, got {}",
            k
        )));
    }

    let n = samples[0].len();
    if let Some(bad) = samples.iter().find(|s| s.len() != n) {
        return Err(SimError::MismatchedReplicationCount {
            expected: n,
            found: bad.len(),
        });
    }
    if n == 0 {
        return Err(SimError::InvalidParameter(
            "Friedman test needs at least one block".to_string(),
        ));
    }
    if samples.iter().flatten().any(|v| !v.is_finite()) {
        return Err(SimError::InvalidParameter(
            "Friedman test needs finite values".to_string(),
        ));
    }

    let mut rank_sums = vec![0.0; k];
    let mut tie_sum = 0.0;
    let mut block = vec![0.0; k];
    for i in 0..n {
        for (j, sample) in samples.iter().enumerate() {
            block[j] = sample[i];
        }
        let (ranks, ties) = average_ranks(&block);
        for (sum, rank) in rank_sums.iter_mut().zip(ranks) {
            *sum += rank;
        }
        tie_sum += ties
            .iter()
            .map(|&t| {
                let t = t as f64;
                t * t * t - t
            })
            .sum::<f64>();
    }

    let (nf, kf) = (n as f64, k as f64);
    let correction = 1.0 - tie_sum / (nf * kf * (kf * kf - 1.0));
    if correction <= 1e-12 {
        return Ok(None);
    }

    let ssbn: f64 = rank_sums.iter().map(|r| r * r).sum();
    let statistic =
        (12.0 / (nf * kf * (kf + 1.0)) * ssbn - 3.0 * nf * (kf + 1.0)) / correction;
    let statistic = statistic.max(0.0);
    let degrees_of_freedom = k - 1;

    Ok(Some(FriedmanChiSquare {
        statistic,
        degrees_of_freedom,
        p_value: chi_square_sf(statistic, degrees_of_freedom as f64),
        mean_ranks: rank_sums.iter().map(|r| r / nf).collect(),
        blocks: n,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_consistent_ordering_closed_form() {
        // Every block ranks the treatments 1, 2, 3: Q = 2n.
        let n = 10;
        let samples = vec![
            (0..n).map(|i| i as f64).collect(),
            (0..n).map(|i| i as f64 + 100.0).collect(),
            (0..n).map(|i| i as f64 + 200.0).collect(),
        ];
        let result = friedman_chi_square(&samples).unwrap().unwrap();

        assert_relative_eq!(result.statistic, 20.0, epsilon = 1e-10);
        assert_eq!(result.degrees_of_freedom, 2);
        assert_relative_eq!(result.p_value, (-10.0f64).exp(), max_relative = 1e-8);
        assert_eq!(result.mean_ranks, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fully_tied_is_degenerate() {
        let samples = vec![vec![5.0; 6], vec![5.0; 6], vec![5.0; 6]];
        assert!(friedman_chi_square(&samples).unwrap().is_none());
    }

    #[test]
    fn test_preconditions() {
        assert!(matches!(
            friedman_chi_square(&[vec![1.0], vec![2.0]]),
            Err(SimError::InvalidParameter(_))
        ));
        assert!(matches!(
            friedman_chi_square(&[vec![1.0, 2.0], vec![2.0, 3.0], vec![3.0]]),
            Err(SimError::MismatchedReplicationCount { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn test_power_against_shifted_configuration() {
        let mut rng = StdRng::seed_from_u64(2718);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let trials = 200;
        let alpha = 0.05;

        let mut rejected = 0;
        for _ in 0..trials {
            let samples: Vec<Vec<f64>> = (0..3)
                .map(|j| {
                    let shift = if j == 2 { 3.0 } else { 0.0 };
                    (0..10).map(|_| noise.sample(&mut rng) + shift).collect()
                })
                .collect();
            let result = friedman_chi_square(&samples).unwrap().unwrap();
            if result.p_value < alpha {
                rejected += 1;
            }
        }

        assert!(rejected as f64 / trials as f64 > 0.9, "power {}/{}", rejected, trials);
    }

    #[test]
    fn test_null_rejection_rate_near_alpha() {
        let mut rng = StdRng::seed_from_u64(31);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let trials = 400;

        let mut rejected = 0;
        for _ in 0..trials {
            let samples: Vec<Vec<f64>> = (0..3)
                .map(|_| (0..10).map(|_| noise.sample(&mut rng)).collect())
                .collect();
            if friedman_chi_square(&samples).unwrap().unwrap().p_value < 0.05 {
                rejected += 1;
            }
        }

        assert!((rejected as f64 / trials as f64) < 0.12);
    }
}
