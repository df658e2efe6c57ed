use crate::classifier::{ClusterId, FeatureBounds, NearestCentroid, PatientFeatures};
use crate::distributions::Distribution;
use crate::error::{SimError, SimResult};
use crate::simulation::Metric;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub arrivals: ArrivalConfig,
    pub resources: ResourceConfig,
    pub simulation: SimulationConfig,
    pub experiment: ExperimentConfig,
    pub clusters: Vec<ClusterProfile>,
    #[serde(default)]
    pub case_mix: CaseMix,
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArrivalConfig {
    /// Exponential inter-arrival times, `rate` patients per hour.
    Poisson { rate: f64 },
    /// Pre-recorded arrival log.
    Scheduled { arrivals: Vec<ScheduledArrival> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledArrival {
    pub time: f64,
    pub cluster: ClusterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub bed_capacity: usize,
    pub ventilator_capacity: usize,
    /// Arrivals finding this many patients already queued for a bed are turned away.
    #[serde(default)]
    pub bed_queue_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Simulated hours.
    pub horizon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub replications: usize,
    pub master_seed: u64,
    #[serde(default = "default_significance_level")]
    pub significance_level: f64,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Metrics compared between scenarios; empty means the default set.
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

fn default_significance_level() -> f64 {
    0.05
}

fn default_parallel() -> bool {
    true
}

/// Per-cluster distribution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub name: String,
    /// Share of Poisson arrivals assigned to this cluster under a weighted case mix.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub icu_stay: Distribution,
    pub ventilation: Distribution,
    pub ventilation_probability: f64,
    /// Percent of the non-ventilated ICU time spent before ventilation starts.
    #[serde(default)]
    pub pre_ventilation_share: f64,
    #[serde(default)]
    pub post_icu_stay: Option<Distribution>,
    #[serde(default)]
    pub mortality_probability: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaseMix {
    /// Draw each cluster by `ClusterProfile::weight`.
    #[default]
    Weighted,
    /// Draw a cohort record per arrival and classify it.
    Cohort {
        records: Vec<PatientFeatures>,
        centroids: Vec<Vec<f64>>,
        #[serde(default)]
        bounds: FeatureBounds,
    },
}

/// Named what-if overrides of the base configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(default)]
    pub bed_capacity: Option<usize>,
    #[serde(default)]
    pub ventilator_capacity: Option<usize>,
    #[serde(default)]
    pub arrival_rate: Option<f64>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        if !self.simulation.horizon.is_finite() || self.simulation.horizon <= 0.0 {
            return Err(SimError::InvalidParameter(
                "Simulation horizon must be positive and finite".to_string(),
            ));
        }

        self.validate_experiment()?;
        self.validate_clusters()?;
        self.validate_arrivals()?;
        self.validate_case_mix()?;

        if self.resources.bed_capacity == 0 {
            warn!("Bed capacity is zero; every patient will wait until the horizon");
        }
        if self.resources.ventilator_capacity == 0
            && self.clusters.iter().any(|c| c.ventilation_probability > 0.0)
        {
            warn!("Ventilator capacity is zero; ventilated patients will wait until the horizon");
        }

        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(SimError::InvalidParameter(format!(
                    "Duplicate scenario name: {}",
                    scenario.name
                )));
            }
            self.with_scenario(scenario)?;
        }

        Ok(())
    }

    fn validate_experiment(&self) -> SimResult<()> {
        if self.experiment.replications == 0 {
            return Err(SimError::InvalidParameter(
                "At least one replication is required".to_string(),
            ));
        }
        let alpha = self.experiment.significance_level;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(SimError::InvalidParameter(format!(
                "Significance level must lie in (0, 1), got {}",
                alpha
            )));
        }
        Ok(())
    }

    fn validate_clusters(&self) -> SimResult<()> {
        if self.clusters.is_empty() {
            return Err(SimError::InvalidParameter(
                "At least one cluster profile must be specified".to_string(),
            ));
        }

        for profile in &self.clusters {
            profile.icu_stay.validate()?;
            profile.ventilation.validate()?;
            if let Some(post) = &profile.post_icu_stay {
                post.validate()?;
            }
            probability(&profile.name, "ventilation_probability", profile.ventilation_probability)?;
            probability(&profile.name, "mortality_probability", profile.mortality_probability)?;
            let share = profile.pre_ventilation_share;
            if !share.is_finite() || !(0.0..=100.0).contains(&share) {
                return Err(SimError::InvalidParameter(format!(
                    "Cluster {}: pre_ventilation_share must be a percentage, got {}",
                    profile.name, share
                )));
            }
            if !profile.weight.is_finite() || profile.weight < 0.0 {
                return Err(SimError::InvalidParameter(format!(
                    "Cluster {}: weight must be non-negative, got {}",
                    profile.name, profile.weight
                )));
            }
        }

        if matches!(self.case_mix, CaseMix::Weighted)
            && self.clusters.iter().map(|c| c.weight).sum::<f64>() <= 0.0
        {
            return Err(SimError::InvalidParameter(
                "Cluster weights must not all be zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_arrivals(&self) -> SimResult<()> {
        match &self.arrivals {
            ArrivalConfig::Poisson { rate } => {
                if !rate.is_finite() || *rate <= 0.0 {
                    return Err(SimError::InvalidParameter(format!(
                        "Arrival rate must be positive and finite, got {}",
                        rate
                    )));
                }
            }
            ArrivalConfig::Scheduled { arrivals } => {
                for arrival in arrivals {
                    if !arrival.time.is_finite() || arrival.time < 0.0 {
                        return Err(SimError::InvalidParameter(format!(
                            "Scheduled arrival time must be non-negative, got {}",
                            arrival.time
                        )));
                    }
                    if arrival.cluster >= self.clusters.len() {
                        return Err(SimError::InvalidParameter(format!(
                            "Scheduled arrival references unknown cluster {}",
                            arrival.cluster
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_case_mix(&self) -> SimResult<()> {
        if let CaseMix::Cohort { records, bounds, .. } = &self.case_mix {
            if records.is_empty() {
                return Err(SimError::InvalidParameter(
                    "Cohort case mix needs at least one record".to_string(),
                ));
            }
            for record in records {
                bounds.check(record)?;
            }
            if let Some(classifier) = self.classifier()? {
                use crate::classifier::Classifier;
                if classifier.n_clusters() > self.clusters.len() {
                    return Err(SimError::InvalidParameter(format!(
                        "{} centroids but only {} cluster profiles",
                        classifier.n_clusters(),
                        self.clusters.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the classifier owned by an experiment, if the case mix needs one.
    pub fn classifier(&self) -> SimResult<Option<NearestCentroid>> {
        match &self.case_mix {
            CaseMix::Weighted => Ok(None),
            CaseMix::Cohort { centroids, .. } => NearestCentroid::new(centroids).map(Some),
        }
    }

    /// The base configuration with a scenario's overrides applied.
    pub fn with_scenario(&self, scenario: &ScenarioConfig) -> SimResult<Config> {
        let mut config = self.clone();
        config.scenarios.clear();

        if let Some(beds) = scenario.bed_capacity {
            config.resources.bed_capacity = beds;
        }
        if let Some(vents) = scenario.ventilator_capacity {
            config.resources.ventilator_capacity = vents;
        }
        if let Some(new_rate) = scenario.arrival_rate {
            match &mut config.arrivals {
                ArrivalConfig::Poisson { rate } => *rate = new_rate,
                ArrivalConfig::Scheduled { .. } => {
                    return Err(SimError::InvalidParameter(format!(
                        "Scenario {} overrides the arrival rate of a scheduled arrival log",
                        scenario.name
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn metrics(&self) -> Vec<Metric> {
        if self.experiment.metrics.is_empty() {
            Metric::DEFAULT_COMPARISON.to_vec()
        } else {
            self.experiment.metrics.clone()
        }
    }
}

fn probability(cluster: &str, name: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!(
            "Cluster {}: {} must lie in [0, 1], got {}",
            cluster, name, value
        )))
    }
}
