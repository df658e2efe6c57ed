//! Non-parametric comparison of replication-level metrics.

pub mod friedman;
pub mod special;
pub mod validation;
pub mod wilcoxon;

use crate::error::{SimError, SimResult};
use crate::experiment::Experiment;
use crate::simulation::Metric;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use friedman::{friedman_chi_square, FriedmanChiSquare};
pub use wilcoxon::{signed_rank, PValueMethod, SignedRank};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    WilcoxonSignedRank,
    Friedman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "direction")]
pub enum EffectDirection {
    None,
    /// The configuration at `index` tends to produce the larger metric.
    Higher { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub test: TestKind,
    pub metric: Metric,
    pub labels: Vec<String>,
    pub statistic: f64,
    pub p_value: f64,
    pub alpha: f64,
    pub significant: bool,
    pub direction: EffectDirection,
    /// No variation to test; reported as no detectable difference.
    pub degenerate: bool,
    /// Paired replications the statistic was computed over.
    pub replications: usize,
    pub failed_replications: usize,
    /// Mean within-replication rank per configuration (Friedman only).
    #[serde(default)]
    pub mean_ranks: Vec<f64>,
}

impl ComparisonReport {
    fn degenerate(test: TestKind, metric: Metric, labels: Vec<String>, alpha: f64, n: usize) -> Self {
        warn!("{}: samples are degenerate, no detectable difference", metric);
        Self {
            test,
            metric,
            labels,
            statistic: 0.0,
            p_value: 1.0,
            alpha,
            significant: false,
            direction: EffectDirection::None,
            degenerate: true,
            replications: n,
            failed_replications: 0,
            mean_ranks: Vec::new(),
        }
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let test = match self.test {
            TestKind::WilcoxonSignedRank => "Wilcoxon",
            TestKind::Friedman => "Friedman",
        };
        if self.degenerate {
            return write!(f, "{} on {}: no detectable difference", test, self.metric);
        }
        write!(
            f,
            "{} on {}: statistic={:.4} p={:.4} ({} at alpha={})",
            test,
            self.metric,
            self.statistic,
            self.p_value,
            if self.significant { "significant" } else { "not significant" },
            self.alpha
        )?;
        if let EffectDirection::Higher { index } = self.direction {
            if let Some(label) = self.labels.get(index) {
                write!(f, ", higher: {}", label)?;
            }
        }
        Ok(())
    }
}

fn check_alpha(alpha: f64) -> SimResult<()> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!(
            "Significance level must lie in (0, 1), got {}",
            alpha
        )))
    }
}

/// Paired two-configuration comparison.
pub fn wilcoxon(metric: Metric, x: &[f64], y: &[f64], alpha: f64) -> SimResult<ComparisonReport> {
    check_alpha(alpha)?;
    let labels = vec!["first".to_string(), "second".to_string()];

    let Some(result) = signed_rank(x, y)? else {
        return Ok(ComparisonReport::degenerate(
            TestKind::WilcoxonSignedRank,
            metric,
            labels,
            alpha,
            x.len(),
        ));
    };

    let significant = result.p_value < alpha;
    let direction = if result.w_plus > result.w_minus {
        EffectDirection::Higher { index: 0 }
    } else if result.w_minus > result.w_plus {
        EffectDirection::Higher { index: 1 }
    } else {
        EffectDirection::None
    };

    Ok(ComparisonReport {
        test: TestKind::WilcoxonSignedRank,
        metric,
        labels,
        statistic: result.statistic,
        p_value: result.p_value,
        alpha,
        significant,
        direction,
        degenerate: false,
        replications: x.len(),
        failed_replications: 0,
        mean_ranks: Vec::new(),
    })
}

/// Paired comparison of three or more configurations.
pub fn friedman(metric: Metric, samples: &[Vec<f64>], alpha: f64) -> SimResult<ComparisonReport> {
    check_alpha(alpha)?;
    let labels: Vec<String> = (0..samples.len()).map(|i| format!("config_{}", i)).collect();

    let Some(result) = friedman_chi_square(samples)? else {
        return Ok(ComparisonReport::degenerate(
            TestKind::Friedman,
            metric,
            labels,
            alpha,
            samples.first().map_or(0, Vec::len),
        ));
    };

    let direction = result
        .mean_ranks
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .filter(|&(_, &rank)| result.mean_ranks.iter().any(|&r| r != rank))
        .map_or(EffectDirection::None, |(index, _)| EffectDirection::Higher { index });

    Ok(ComparisonReport {
        test: TestKind::Friedman,
        metric,
        labels,
        statistic: result.statistic,
        p_value: result.p_value,
        alpha,
        significant: result.p_value < alpha,
        direction,
        degenerate: false,
        replications: result.blocks,
        failed_replications: 0,
        mean_ranks: result.mean_ranks,
    })
}

/// Compare experiments on one metric, pairing replications by index.
///
/// Two experiments use Wilcoxon, three or more use Friedman. Only replication
/// indices that every experiment completed are used; the rest are reported as
/// failed.
pub fn compare_experiments(
    experiments: &[&Experiment],
    metric: Metric,
    alpha: f64,
) -> SimResult<ComparisonReport> {
    if experiments.len() < 2 {
        return Err(SimError::InvalidParameter(format!(
            "Comparison needs at least two experiments, got {}",
            experiments.len()
        )));
    }

    let expected = experiments[0].replication_count();
    for experiment in &experiments[1..] {
        if experiment.replication_count() != expected {
            return Err(SimError::MismatchedReplicationCount {
                expected,
                found: experiment.replication_count(),
            });
        }
        if experiment.seeds() != experiments[0].seeds() {
            warn!(
                "Experiments {} and {} use different seeds; pairing assumes common random numbers",
                experiments[0].name(),
                experiment.name()
            );
        }
    }

    let surviving: BTreeSet<usize> = (0..expected)
        .filter(|&i| experiments.iter().all(|e| e.result(i).is_some()))
        .collect();
    let failed = expected - surviving.len();

    let samples: Vec<Vec<f64>> = experiments
        .iter()
        .map(|e| {
            e.results()
                .iter()
                .filter(|r| surviving.contains(&r.replication))
                .map(|r| r.metric(metric))
                .collect()
        })
        .collect();

    let mut report = if experiments.len() == 2 {
        wilcoxon(metric, &samples[0], &samples[1], alpha)?
    } else {
        friedman(metric, &samples, alpha)?
    };
    report.labels = experiments.iter().map(|e| e.name().to_string()).collect();
    report.failed_replications = failed;

    info!("{}", report);
    if failed > 0 {
        warn!("{} replications excluded from the {} comparison", failed, metric);
    }

    Ok(report)
}

/// Average ranks (1-based) and the sizes of each group of equal values.
pub fn average_ranks(values: &[f64]) -> (Vec<f64>, Vec<usize>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut ties = Vec::new();
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end share the mean of ranks start+1..=end.
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        ties.push(end - start);
        start = end;
    }

    (ranks, ties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::poisson_config;
    use crate::experiment::{derive_seeds, Experiment};
    use crate::simulation::single_run;

    #[test]
    fn test_average_ranks_with_ties() {
        let (ranks, ties) = average_ranks(&[3.0, 1.0, 4.0, 1.0, 5.0]);
        assert_eq!(ranks, vec![3.0, 1.5, 4.0, 1.5, 5.0]);
        assert_eq!(ties, vec![2, 1, 1, 1]);
    }

    #[test]
    fn test_identical_sequences_no_detectable_difference() {
        let x = [5.0, 5.0, 5.0, 5.0, 5.0];
        let report = wilcoxon(Metric::BedWait, &x, &x, 0.05).unwrap();

        assert!(report.degenerate);
        assert!(!report.significant);
        assert_eq!(report.p_value, 1.0);
        assert_eq!(report.direction, EffectDirection::None);
        assert!(report.to_string().contains("no detectable difference"));
    }

    #[test]
    fn test_wilcoxon_direction() {
        let x: Vec<f64> = (0..12).map(|i| 10.0 + i as f64).collect();
        let y: Vec<f64> = (0..12).map(|i| 1.0 + i as f64 * 0.9).collect();
        let report = wilcoxon(Metric::LengthOfStay, &x, &y, 0.05).unwrap();

        assert!(report.significant);
        assert_eq!(report.direction, EffectDirection::Higher { index: 0 });
    }

    #[test]
    fn test_alpha_is_caller_supplied() {
        let x: Vec<f64> = (1..=6).map(|i| i as f64).collect();
        let y = vec![0.0; 6];
        // Exact p = 2/64 = 0.03125
        assert!(wilcoxon(Metric::BedWait, &x, &y, 0.05).unwrap().significant);
        assert!(!wilcoxon(Metric::BedWait, &x, &y, 0.01).unwrap().significant);
        assert!(wilcoxon(Metric::BedWait, &x, &y, 0.0).is_err());
    }

    #[test]
    fn test_friedman_direction_and_ranks() {
        let samples = vec![
            vec![1.0, 2.0, 1.5, 1.2],
            vec![2.0, 3.0, 2.5, 2.2],
            vec![9.0, 8.0, 9.5, 9.9],
        ];
        let report = friedman(Metric::BedWait, &samples, 0.05).unwrap();
        assert_eq!(report.direction, EffectDirection::Higher { index: 2 });
        assert_eq!(report.mean_ranks, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_compare_experiments_more_beds_reduces_wait() {
        let base = poisson_config(0.15, 4, 2);
        let mut more = base.clone();
        more.resources.bed_capacity = 30;
        more.resources.ventilator_capacity = 20;

        let a = Experiment::run("4 beds", &base).unwrap();
        let b = Experiment::run("30 beds", &more).unwrap();
        let report = compare_experiments(&[&a, &b], Metric::BedWait, 0.05).unwrap();

        assert_eq!(report.test, TestKind::WilcoxonSignedRank);
        assert_eq!(report.labels, vec!["4 beds".to_string(), "30 beds".to_string()]);
        assert!(report.significant);
        assert_eq!(report.direction, EffectDirection::Higher { index: 0 });
        assert_eq!(report.failed_replications, 0);
    }

    #[test]
    fn test_compare_three_experiments_uses_friedman() {
        let base = poisson_config(0.15, 4, 2);
        let experiments: Vec<Experiment> = [4, 10, 30]
            .iter()
            .map(|&beds| {
                let mut config = base.clone();
                config.resources.bed_capacity = beds;
                Experiment::run(&format!("{} beds", beds), &config).unwrap()
            })
            .collect();
        let refs: Vec<&Experiment> = experiments.iter().collect();

        let report = compare_experiments(&refs, Metric::BedUtilization, 0.05).unwrap();
        assert_eq!(report.test, TestKind::Friedman);
        assert_eq!(report.replications, base.experiment.replications);
        assert_eq!(report.mean_ranks.len(), 3);
    }

    #[test]
    fn test_compare_skips_failed_replications() {
        let config = poisson_config(0.15, 4, 2);
        let seeds = derive_seeds(9, 8);
        let healthy = Experiment::run_with("healthy", &config, &seeds, false, |i, seed| {
            single_run(&config, None, i, seed)
        })
        .unwrap();
        let flaky = Experiment::run_with("flaky", &config, &seeds, false, |i, seed| {
            if i % 4 == 1 {
                Err(SimError::ResourceMisuse("double release".to_string()))
            } else {
                single_run(&config, None, i, seed)
            }
        })
        .unwrap();

        let report = compare_experiments(&[&healthy, &flaky], Metric::BedWait, 0.05).unwrap();
        assert_eq!(report.failed_replications, 2);
        // Identical configurations and seeds give identical surviving runs.
        assert!(report.degenerate);
        assert_eq!(report.replications, 6);
    }

    #[test]
    fn test_compare_mismatched_replication_counts() {
        let mut short = poisson_config(0.15, 4, 2);
        short.experiment.replications = 3;
        let long = poisson_config(0.15, 4, 2);

        let a = Experiment::run("short", &short).unwrap();
        let b = Experiment::run("long", &long).unwrap();
        assert!(matches!(
            compare_experiments(&[&a, &b], Metric::BedWait, 0.05),
            Err(SimError::MismatchedReplicationCount { expected: 3, found: 8 })
        ));
    }
}
