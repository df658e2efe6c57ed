//! Replication orchestration: many independent single runs per configuration.

use crate::classifier::Classifier;
use crate::config::Config;
use crate::error::{SimError, SimResult};
use crate::simulation::metrics::{mean, std_dev};
use crate::simulation::{single_run, Metric, RunResult};
use crate::stats::special::normal_quantile;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-replication seeds drawn from a generator seeded with the master seed.
pub fn derive_seeds(master_seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(master_seed);
    (0..n).map(|_| rng.gen()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFailure {
    pub replication: usize,
    pub seed: u64,
    pub error: String,
    /// The run started and was aborted by an engine fault, rather than rejected at setup.
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: Metric,
    pub replications: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub confidence: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    name: String,
    config: Config,
    seeds: Vec<u64>,
    results: Vec<RunResult>,
    failures: Vec<ReplicationFailure>,
}

impl Experiment {
    /// Run `config.experiment.replications` replications seeded from the master seed.
    pub fn run(name: &str, config: &Config) -> SimResult<Self> {
        let seeds = derive_seeds(
            config.experiment.master_seed,
            config.experiment.replications,
        );
        run_replications(name, config, config.experiment.replications, &seeds)
    }

    /// Run one replication per seed with a custom runner. Runner errors are
    /// recorded as failed replications.
    pub fn run_with<F>(
        name: &str,
        config: &Config,
        seeds: &[u64],
        parallel: bool,
        runner: F,
    ) -> SimResult<Self>
    where
        F: Fn(usize, u64) -> SimResult<RunResult> + Sync,
    {
        config.validate()?;
        info!(
            "Experiment {}: {} replications ({})",
            name,
            seeds.len(),
            if parallel { "parallel" } else { "serial" }
        );

        let outcomes: Vec<SimResult<RunResult>> = if parallel {
            seeds
                .par_iter()
                .enumerate()
                .map(|(index, &seed)| runner(index, seed))
                .collect()
        } else {
            seeds
                .iter()
                .enumerate()
                .map(|(index, &seed)| runner(index, seed))
                .collect()
        };

        let mut results = Vec::with_capacity(seeds.len());
        let mut failures = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(result) => {
                    debug!("Experiment {}: replication {} done", name, index);
                    results.push(result);
                }
                Err(err) => {
                    let aborted = err.is_fatal_to_run();
                    if aborted {
                        warn!("Experiment {}: replication {} aborted: {}", name, index, err);
                    } else {
                        error!("Experiment {}: replication {} could not start: {}", name, index, err);
                    }
                    failures.push(ReplicationFailure {
                        replication: index,
                        seed: seeds[index],
                        error: err.to_string(),
                        aborted,
                    });
                }
            }
        }

        info!(
            "Experiment {} completed: {} succeeded, {} failed",
            name,
            results.len(),
            failures.len()
        );

        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            seeds: seeds.to_vec(),
            results,
            failures,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn failures(&self) -> &[ReplicationFailure] {
        &self.failures
    }

    pub fn replication_count(&self) -> usize {
        self.seeds.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn result(&self, replication: usize) -> Option<&RunResult> {
        self.results.iter().find(|r| r.replication == replication)
    }

    /// One value per successful replication, in replication order.
    pub fn metric_values(&self, metric: Metric) -> Vec<f64> {
        self.results.iter().map(|r| r.metric(metric)).collect()
    }

    pub fn summary(&self, metric: Metric, confidence: f64) -> SimResult<MetricSummary> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(SimError::InvalidParameter(format!(
                "Confidence level must lie in (0, 1), got {}",
                confidence
            )));
        }

        let values = self.metric_values(metric);
        let mean_val = mean(&values);
        let sd = std_dev(&values);
        let half_width = if sd == 0.0 || values.is_empty() {
            0.0
        } else {
            let z = normal_quantile(1.0 - (1.0 - confidence) / 2.0);
            z * sd / (values.len() as f64).sqrt()
        };

        Ok(MetricSummary {
            metric,
            replications: values.len(),
            mean: mean_val,
            std_dev: sd,
            confidence,
            ci_lower: mean_val - half_width,
            ci_upper: mean_val + half_width,
        })
    }
}

/// Run `n` replications of `config`, replication `i` seeded with `seeds[i]`.
pub fn run_replications(name: &str, config: &Config, n: usize, seeds: &[u64]) -> SimResult<Experiment> {
    if seeds.len() < n {
        return Err(SimError::InvalidParameter(format!(
            "{} replications requested but only {} seeds supplied",
            n,
            seeds.len()
        )));
    }
    config.validate()?;

    let classifier = config.classifier()?;
    let classifier = classifier.as_ref().map(|c| c as &dyn Classifier);

    Experiment::run_with(
        name,
        config,
        &seeds[..n],
        config.experiment.parallel,
        |index, seed| single_run(config, classifier, index, seed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::poisson_config;
    use approx::assert_relative_eq;

    #[test]
    fn test_seed_derivation_is_deterministic() {
        let a = derive_seeds(42, 10);
        let b = derive_seeds(42, 10);
        assert_eq!(a, b);
        assert_ne!(a, derive_seeds(43, 10));
        let unique: std::collections::HashSet<_> = a.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_experiment_is_reproducible() {
        let config = poisson_config(0.15, 6, 3);
        let a = Experiment::run("base", &config).unwrap();
        let b = Experiment::run("base", &config).unwrap();

        assert_eq!(a.results(), b.results());
        assert_eq!(a.results().len(), config.experiment.replications);
        assert_eq!(a.failed_count(), 0);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let mut serial = poisson_config(0.15, 6, 3);
        serial.experiment.parallel = false;
        let mut parallel = serial.clone();
        parallel.experiment.parallel = true;

        let a = Experiment::run("serial", &serial).unwrap();
        let b = Experiment::run("parallel", &parallel).unwrap();
        assert_eq!(a.results(), b.results());
    }

    #[test]
    fn test_replications_are_distinct() {
        let config = poisson_config(0.15, 6, 3);
        let experiment = Experiment::run("base", &config).unwrap();
        let values = experiment.metric_values(Metric::Arrivals);
        assert!(values.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_failed_replication_is_recorded_and_others_continue() {
        let config = poisson_config(0.15, 6, 3);
        let seeds = derive_seeds(1, 5);

        let experiment = Experiment::run_with("faulty", &config, &seeds, true, |index, seed| {
            if index == 2 {
                Err(SimError::ResourceMisuse("token released twice".to_string()))
            } else {
                single_run(&config, None, index, seed)
            }
        })
        .unwrap();

        assert_eq!(experiment.failed_count(), 1);
        assert!(experiment.failures()[0].aborted);
        assert_eq!(experiment.failures()[0].replication, 2);
        assert_eq!(experiment.failures()[0].seed, seeds[2]);
        assert_eq!(experiment.results().len(), 4);
        assert!(experiment.result(2).is_none());
        assert!(experiment.result(3).is_some());
    }

    #[test]
    fn test_setup_errors_are_not_marked_aborted() {
        let config = poisson_config(0.15, 6, 3);
        let seeds = derive_seeds(3, 3);

        let experiment = Experiment::run_with("setup", &config, &seeds, false, |index, seed| {
            if index == 0 {
                Err(SimError::InvalidParameter("arrival rate: -1".to_string()))
            } else {
                single_run(&config, None, index, seed)
            }
        })
        .unwrap();

        assert_eq!(experiment.failed_count(), 1);
        assert!(!experiment.failures()[0].aborted);
        assert_eq!(experiment.results().len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected_before_running() {
        let mut config = poisson_config(0.15, 6, 3);
        config.clusters[0].icu_stay = crate::distributions::Distribution::LogNormal {
            mu: 1.0,
            sigma: f64::NAN,
        };
        assert!(matches!(
            Experiment::run("bad", &config),
            Err(SimError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_too_few_seeds() {
        let config = poisson_config(0.15, 6, 3);
        assert!(run_replications("x", &config, 3, &[1, 2]).is_err());
    }

    #[test]
    fn test_summary_interval() {
        let config = poisson_config(0.15, 6, 3);
        let experiment = Experiment::run("base", &config).unwrap();
        let summary = experiment.summary(Metric::LengthOfStay, 0.95).unwrap();

        let values = experiment.metric_values(Metric::LengthOfStay);
        assert_relative_eq!(summary.mean, mean(&values));
        let half = 1.959964 * summary.std_dev / (values.len() as f64).sqrt();
        assert_relative_eq!(summary.ci_upper - summary.mean, half, max_relative = 1e-5);
        assert!(experiment.summary(Metric::LengthOfStay, 1.5).is_err());
    }
}
