//! Agreement between simulated output and observed patient data.

use super::special::{anderson_darling_significance, kolmogorov_sf, normal_quantile};
use crate::classifier::{Classifier, ClusterId, PatientFeatures};
use crate::error::{SimError, SimResult};
use crate::experiment::Experiment;
use crate::simulation::metrics::{mean, std_dev};
use crate::simulation::PhaseDurations;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMargin {
    pub rmse: f64,
    pub mae: f64,
    /// Undefined when every observed value is zero.
    pub mape: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KolmogorovSmirnov {
    pub statistic: f64,
    pub p_value: f64,
}

/// Phase durations compared between cohort and simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseVariable {
    PreVentilation,
    Ventilation,
    PostVentilation,
    IcuStay,
    PostIcuStay,
}

impl PhaseVariable {
    pub const ALL: [PhaseVariable; 5] = [
        PhaseVariable::PreVentilation,
        PhaseVariable::Ventilation,
        PhaseVariable::PostVentilation,
        PhaseVariable::IcuStay,
        PhaseVariable::PostIcuStay,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PhaseVariable::PreVentilation => "pre_ventilation",
            PhaseVariable::Ventilation => "ventilation",
            PhaseVariable::PostVentilation => "post_ventilation",
            PhaseVariable::IcuStay => "icu_stay",
            PhaseVariable::PostIcuStay => "post_icu_stay",
        }
    }

    pub fn simulated(&self, durations: &PhaseDurations) -> Option<f64> {
        match self {
            PhaseVariable::PreVentilation => Some(durations.pre_ventilation),
            PhaseVariable::Ventilation => durations.ventilation,
            PhaseVariable::PostVentilation => Some(durations.post_ventilation),
            PhaseVariable::IcuStay => Some(durations.icu_stay),
            PhaseVariable::PostIcuStay => durations.post_icu,
        }
    }

    /// Observed value of a cohort record. The pre/post split applies the
    /// cluster's `pre_ventilation_share` the same way arrivals do. Records
    /// carry no post-ICU stay.
    pub fn observed(&self, record: &PatientFeatures, pre_ventilation_share: f64) -> Option<f64> {
        let ventilation = if record.is_ventilated() {
            record.ventilation_time.min(record.icu_stay)
        } else {
            0.0
        };
        let pre = (record.icu_stay - ventilation) * pre_ventilation_share / 100.0;
        match self {
            PhaseVariable::PreVentilation => Some(pre),
            PhaseVariable::Ventilation => record.is_ventilated().then_some(ventilation),
            PhaseVariable::PostVentilation => Some((record.icu_stay - pre - ventilation).max(0.0)),
            PhaseVariable::IcuStay => Some(record.icu_stay),
            PhaseVariable::PostIcuStay => None,
        }
    }
}

impl fmt::Display for PhaseVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValidation {
    pub variable: PhaseVariable,
    pub observed: usize,
    pub simulated: usize,
    /// Clusters present in both the cohort and the simulation.
    pub clusters: usize,
    /// Percent of clusters whose observed mean falls inside the simulated interval.
    pub coverage: Option<f64>,
    /// Observed against simulated cluster means.
    pub error_margin: Option<ErrorMargin>,
    pub ks: KolmogorovSmirnov,
    /// Absent when the pooled values cannot be ranked (too few or all equal).
    pub anderson_darling: Option<AndersonDarling>,
}

/// Simulated phase durations checked against the cohort they were drawn for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub observed_patients: usize,
    pub simulated_patients: usize,
    pub per_variable: Vec<VariableValidation>,
    /// Mean KS statistic and p-value over the validated variables.
    pub overall_ks: KolmogorovSmirnov,
}

impl ValidationReport {
    pub fn variable(&self, variable: PhaseVariable) -> Option<&VariableValidation> {
        self.per_variable.iter().find(|v| v.variable == variable)
    }
}

/// Compare each phase duration of `experiment` with the observed cohort.
///
/// Variables without values on both sides are skipped. Returns `Ok(None)` when
/// nothing can be compared.
pub fn validate_phases(
    experiment: &Experiment,
    records: &[PatientFeatures],
    classifier: &dyn Classifier,
    confidence: f64,
) -> SimResult<Option<ValidationReport>> {
    let simulated_patients: usize = experiment.results().iter().map(|r| r.patients.len()).sum();
    if records.is_empty() || simulated_patients == 0 {
        warn!(
            "Nothing to validate: {} observed, {} simulated patients",
            records.len(),
            simulated_patients
        );
        return Ok(None);
    }

    let assigned: Vec<(ClusterId, &PatientFeatures)> =
        records.iter().map(|r| (classifier.classify(r), r)).collect();

    let mut per_variable = Vec::new();
    for variable in PhaseVariable::ALL {
        match validate_variable(variable, experiment, &assigned, classifier.n_clusters(), confidence)? {
            Some(result) => per_variable.push(result),
            None => debug!("{}: no values on both sides, skipped", variable),
        }
    }
    if per_variable.is_empty() {
        warn!("No phase variable appears in both the cohort and the simulation");
        return Ok(None);
    }

    let statistics: Vec<f64> = per_variable.iter().map(|v| v.ks.statistic).collect();
    let p_values: Vec<f64> = per_variable.iter().map(|v| v.ks.p_value).collect();
    let overall_ks = KolmogorovSmirnov {
        statistic: mean(&statistics),
        p_value: mean(&p_values),
    };
    info!(
        "Validation over {} variables: KS D={:.3} p={:.3}",
        per_variable.len(),
        overall_ks.statistic,
        overall_ks.p_value
    );

    Ok(Some(ValidationReport {
        observed_patients: records.len(),
        simulated_patients,
        per_variable,
        overall_ks,
    }))
}

fn validate_variable(
    variable: PhaseVariable,
    experiment: &Experiment,
    assigned: &[(ClusterId, &PatientFeatures)],
    n_clusters: usize,
    confidence: f64,
) -> SimResult<Option<VariableValidation>> {
    let profiles = &experiment.config().clusters;

    // Observed values grouped by the cluster the classifier assigns.
    let mut observed_by_cluster = vec![Vec::new(); n_clusters];
    for &(cluster, record) in assigned {
        let share = profiles.get(cluster).map_or(0.0, |p| p.pre_ventilation_share);
        if let (Some(bucket), Some(value)) =
            (observed_by_cluster.get_mut(cluster), variable.observed(record, share))
        {
            bucket.push(value);
        }
    }

    // Per-replication cluster means, plus every simulated value pooled.
    let mut simulated_by_cluster = vec![Vec::new(); n_clusters];
    let mut pooled = Vec::new();
    for result in experiment.results() {
        let mut per_cluster = vec![Vec::new(); n_clusters];
        for patient in &result.patients {
            if let Some(value) = variable.simulated(&patient.durations) {
                pooled.push(value);
                if let Some(bucket) = per_cluster.get_mut(patient.cluster) {
                    bucket.push(value);
                }
            }
        }
        for (cluster, values) in per_cluster.iter().enumerate() {
            if !values.is_empty() {
                simulated_by_cluster[cluster].push(mean(values));
            }
        }
    }

    let observed_all: Vec<f64> = observed_by_cluster.iter().flatten().copied().collect();
    if observed_all.is_empty() || pooled.is_empty() {
        return Ok(None);
    }

    let (observed, simulated): (Vec<f64>, Vec<Vec<f64>>) = observed_by_cluster
        .iter()
        .zip(simulated_by_cluster)
        .filter(|(obs, sim)| !obs.is_empty() && !sim.is_empty())
        .map(|(obs, sim)| (mean(obs), sim))
        .unzip();

    let (coverage, margin) = if observed.is_empty() {
        (None, None)
    } else {
        let predicted: Vec<f64> = simulated.iter().map(|reps| mean(reps)).collect();
        (
            Some(coverage_percentage(&observed, &simulated, confidence)?),
            Some(error_margin(&observed, &predicted)?),
        )
    };

    let anderson_darling = match anderson_darling_k_sample(&[&observed_all, &pooled]) {
        Ok(result) => Some(result),
        Err(err) => {
            warn!("{}: Anderson-Darling test skipped: {}", variable, err);
            None
        }
    };

    Ok(Some(VariableValidation {
        variable,
        observed: observed_all.len(),
        simulated: pooled.len(),
        clusters: observed.len(),
        coverage,
        error_margin: margin,
        ks: ks_two_sample(&observed_all, &pooled)?,
        anderson_darling,
    }))
}

/// Percent of patients whose observed value lies inside the confidence
/// interval of their simulated replicates. `simulated[i]` holds patient `i`'s
/// replicate values.
pub fn coverage_percentage(
    observed: &[f64],
    simulated: &[Vec<f64>],
    confidence: f64,
) -> SimResult<f64> {
    if observed.len() != simulated.len() {
        return Err(SimError::MismatchedReplicationCount {
            expected: observed.len(),
            found: simulated.len(),
        });
    }
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(SimError::InvalidParameter(format!(
            "Confidence level must lie in (0, 1), got {}",
            confidence
        )));
    }
    if !(0.80..=0.95).contains(&confidence) {
        warn!("Confidence level {:.2} is outside the recommended 0.80-0.95 range", confidence);
    }
    if observed.is_empty() {
        return Ok(0.0);
    }

    let z = normal_quantile(1.0 - (1.0 - confidence) / 2.0);
    let mut covered = 0;
    for (truth, reps) in observed.iter().zip(simulated.iter()) {
        let centre = mean(reps);
        let half_width = if reps.len() < 2 {
            0.0
        } else {
            z * std_dev(reps) / (reps.len() as f64).sqrt()
        };
        if *truth >= centre - half_width && *truth <= centre + half_width {
            covered += 1;
        }
    }

    Ok(covered as f64 / observed.len() as f64 * 100.0)
}

pub fn error_margin(observed: &[f64], predicted: &[f64]) -> SimResult<ErrorMargin> {
    if observed.len() != predicted.len() {
        return Err(SimError::MismatchedReplicationCount {
            expected: observed.len(),
            found: predicted.len(),
        });
    }
    if observed.is_empty() {
        return Err(SimError::InvalidParameter(
            "error margin needs at least one value".to_string(),
        ));
    }

    let n = observed.len() as f64;
    let pairs = observed.iter().zip(predicted.iter());
    let rmse = (pairs.clone().map(|(o, p)| (o - p).powi(2)).sum::<f64>() / n).sqrt();
    let mae = pairs.clone().map(|(o, p)| (o - p).abs()).sum::<f64>() / n;

    let relative: Vec<f64> = pairs
        .filter(|(o, _)| **o != 0.0)
        .map(|(o, p)| ((o - p) / o).abs())
        .collect();
    let mape = if relative.is_empty() {
        warn!("MAPE undefined: all observed values are zero");
        None
    } else {
        Some(mean(&relative) * 100.0)
    };

    info!("RMSE={:.2} MAE={:.2} MAPE={:?}", rmse, mae, mape);
    Ok(ErrorMargin { rmse, mae, mape })
}

/// Two-sample Kolmogorov-Smirnov test with the asymptotic p-value.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> SimResult<KolmogorovSmirnov> {
    if a.is_empty() || b.is_empty() {
        return Err(SimError::InvalidParameter(
            "Kolmogorov-Smirnov test needs two non-empty samples".to_string(),
        ));
    }
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(SimError::InvalidParameter(
            "Kolmogorov-Smirnov test needs finite values".to_string(),
        ));
    }

    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut statistic: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        statistic = statistic.max((i as f64 / n - j as f64 / m).abs());
    }

    let en = (n * m / (n + m)).sqrt();
    let p_value = kolmogorov_sf((en + 0.12 + 0.11 / en) * statistic);

    Ok(KolmogorovSmirnov { statistic, p_value })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndersonDarling {
    /// Standardized statistic, (A2 - (k - 1)) / sigma.
    pub statistic: f64,
    /// Midrank A2akN before standardization.
    pub a2: f64,
    /// Approximate, capped to [0.001, 0.25].
    pub significance_level: f64,
}

/// Anderson-Darling k-sample test of Scholz and Stephens, midrank form so
/// tied values are handled.
pub fn anderson_darling_k_sample(samples: &[&[f64]]) -> SimResult<AndersonDarling> {
    let k = samples.len();
    if k < 2 {
        return Err(SimError::InvalidParameter(format!(
            "Anderson-Darling test needs at least 2 samples, got {}",
            k
        )));
    }
    if samples.iter().any(|s| s.is_empty()) {
        return Err(SimError::InvalidParameter(
            "Anderson-Darling test needs non-empty samples".to_string(),
        ));
    }
    if samples.iter().flat_map(|s| s.iter()).any(|v| !v.is_finite()) {
        return Err(SimError::InvalidParameter(
            "Anderson-Darling test needs finite values".to_string(),
        ));
    }

    let mut pooled: Vec<f64> = samples.iter().flat_map(|s| s.iter().copied()).collect();
    pooled.sort_by(f64::total_cmp);
    let n_total = pooled.len();
    if n_total < 4 {
        return Err(SimError::InvalidParameter(format!(
            "Anderson-Darling test needs at least 4 values, got {}",
            n_total
        )));
    }
    let mut distinct = pooled.clone();
    distinct.dedup();
    if distinct.len() < 2 {
        return Err(SimError::InvalidParameter(
            "Anderson-Darling test needs at least two distinct values".to_string(),
        ));
    }

    let nf = n_total as f64;
    let mut a2 = 0.0;
    for sample in samples {
        let mut sorted = sample.to_vec();
        sorted.sort_by(f64::total_cmp);
        let ni = sorted.len() as f64;

        let mut inner = 0.0;
        for &z in &distinct {
            let left = count_below(&pooled, z) as f64;
            let ties = count_at_most(&pooled, z) as f64 - left;
            let b = left + ties / 2.0;
            let right = count_at_most(&sorted, z);
            let own_ties = (right - count_below(&sorted, z)) as f64;
            let m = right as f64 - own_ties / 2.0;
            inner += ties / nf * (nf * m - b * ni).powi(2) / (b * (nf - b) - nf * ties / 4.0);
        }
        a2 += inner / ni;
    }
    a2 *= (nf - 1.0) / nf;

    // Variance of A2 under the null.
    let big_h: f64 = samples.iter().map(|s| 1.0 / s.len() as f64).sum();
    let mut partial = 0.0;
    let mut g = 0.0;
    for (t, d) in (2..n_total).rev().enumerate() {
        partial += 1.0 / d as f64;
        g += partial / (t + 2) as f64;
    }
    let h = partial + 1.0;
    let kf = k as f64;
    let a = (4.0 * g - 6.0) * (kf - 1.0) + (10.0 - 6.0 * g) * big_h;
    let b = (2.0 * g - 4.0) * kf * kf + 8.0 * h * kf + (2.0 * g - 14.0 * h - 4.0) * big_h
        - 8.0 * h
        + 4.0 * g
        - 6.0;
    let c = (6.0 * h + 2.0 * g - 2.0) * kf * kf + (4.0 * h - 4.0 * g + 6.0) * kf
        + (2.0 * h - 6.0) * big_h
        + 4.0 * h;
    let d = (2.0 * h + 6.0) * kf * kf - 4.0 * h * kf;
    let sigma_sq = (a * nf.powi(3) + b * nf * nf + c * nf + d) / ((nf - 1.0) * (nf - 2.0) * (nf - 3.0));

    let m = kf - 1.0;
    let statistic = (a2 - m) / sigma_sq.sqrt();

    Ok(AndersonDarling {
        statistic,
        a2,
        significance_level: anderson_darling_significance(statistic, m),
    })
}

fn count_below(sorted: &[f64], z: f64) -> usize {
    sorted.partition_point(|&v| v < z)
}

fn count_at_most(sorted: &[f64], z: f64) -> usize {
    sorted.partition_point(|&v| v <= z)
}
