use super::patient::{Outcome, Patient};
use crate::resources::PoolUsage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication-level outcome measures shared by runs, experiments and comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean ICU length of stay of completed patients, queueing included.
    LengthOfStay,
    LengthOfStayP90,
    /// Mean delay between arrival and admission.
    BedWait,
    VentilatorWait,
    PreVentilation,
    Ventilation,
    PostVentilation,
    PostIcuStay,
    BedUtilization,
    VentilatorUtilization,
    Arrivals,
    Completed,
    Censored,
    Rejected,
    /// Patients who had to queue for a bed.
    BlockedForBed,
    BlockedForVentilator,
    Mortality,
}

impl Metric {
    pub const ALL: [Metric; 17] = [
        Metric::LengthOfStay,
        Metric::LengthOfStayP90,
        Metric::BedWait,
        Metric::VentilatorWait,
        Metric::PreVentilation,
        Metric::Ventilation,
        Metric::PostVentilation,
        Metric::PostIcuStay,
        Metric::BedUtilization,
        Metric::VentilatorUtilization,
        Metric::Arrivals,
        Metric::Completed,
        Metric::Censored,
        Metric::Rejected,
        Metric::BlockedForBed,
        Metric::BlockedForVentilator,
        Metric::Mortality,
    ];

    pub const DEFAULT_COMPARISON: [Metric; 4] = [
        Metric::LengthOfStay,
        Metric::BedWait,
        Metric::BedUtilization,
        Metric::BlockedForBed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Metric::LengthOfStay => "length_of_stay",
            Metric::LengthOfStayP90 => "length_of_stay_p90",
            Metric::BedWait => "bed_wait",
            Metric::VentilatorWait => "ventilator_wait",
            Metric::PreVentilation => "pre_ventilation",
            Metric::Ventilation => "ventilation",
            Metric::PostVentilation => "post_ventilation",
            Metric::PostIcuStay => "post_icu_stay",
            Metric::BedUtilization => "bed_utilization",
            Metric::VentilatorUtilization => "ventilator_utilization",
            Metric::Arrivals => "arrivals",
            Metric::Completed => "completed",
            Metric::Censored => "censored",
            Metric::Rejected => "rejected",
            Metric::BlockedForBed => "blocked_for_bed",
            Metric::BlockedForVentilator => "blocked_for_ventilator",
            Metric::Mortality => "mortality",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub arrivals: usize,
    pub completed: usize,
    pub censored: usize,
    pub rejected: usize,
    pub deceased: usize,
    pub blocked_for_bed: usize,
    pub blocked_for_ventilator: usize,
    pub mean_length_of_stay: f64,
    pub length_of_stay_p50: f64,
    pub length_of_stay_p90: f64,
    pub length_of_stay_p95: f64,
    pub mean_bed_wait: f64,
    pub mean_ventilator_wait: f64,
    pub mean_pre_ventilation: f64,
    pub mean_ventilation: f64,
    pub mean_post_ventilation: f64,
    pub mean_post_icu_stay: f64,
    pub bed_utilization: f64,
    pub ventilator_utilization: f64,
    pub bed_usage: PoolUsage,
    pub ventilator_usage: PoolUsage,
}

impl RunMetrics {
    /// Per-patient means are taken over completed patients only.
    pub fn from_patients(
        patients: &[Patient],
        bed_usage: PoolUsage,
        ventilator_usage: PoolUsage,
        elapsed: f64,
    ) -> Self {
        let completed: Vec<&Patient> = patients.iter().filter(|p| p.is_completed()).collect();

        let mut los: Vec<f64> = completed.iter().filter_map(|p| p.length_of_stay()).collect();
        los.sort_by(f64::total_cmp);

        let bed_waits: Vec<f64> = completed.iter().filter_map(|p| p.bed_wait()).collect();
        let vent_waits: Vec<f64> = completed.iter().filter_map(|p| p.ventilator_wait()).collect();
        let pre: Vec<f64> = completed.iter().map(|p| p.durations.pre_ventilation).collect();
        let vent: Vec<f64> = completed.iter().filter_map(|p| p.durations.ventilation).collect();
        let post: Vec<f64> = completed.iter().map(|p| p.durations.post_ventilation).collect();
        let post_icu: Vec<f64> = completed.iter().filter_map(|p| p.durations.post_icu).collect();

        let count = |outcome: Outcome| patients.iter().filter(|p| p.outcome == outcome).count();

        Self {
            arrivals: patients.len(),
            completed: completed.len(),
            censored: count(Outcome::Censored),
            rejected: count(Outcome::Rejected),
            deceased: count(Outcome::Deceased),
            blocked_for_bed: patients
                .iter()
                .filter(|p| p.admitted_at.map_or(p.outcome != Outcome::Rejected, |t| t > p.arrival))
                .count(),
            blocked_for_ventilator: patients
                .iter()
                .filter(|p| match (p.ventilation_requested_at, p.ventilation_started_at) {
                    (Some(requested), Some(started)) => started > requested,
                    (Some(_), None) => true,
                    _ => false,
                })
                .count(),
            mean_length_of_stay: mean(&los),
            length_of_stay_p50: percentile(&los, 50.0),
            length_of_stay_p90: percentile(&los, 90.0),
            length_of_stay_p95: percentile(&los, 95.0),
            mean_bed_wait: mean(&bed_waits),
            mean_ventilator_wait: mean(&vent_waits),
            mean_pre_ventilation: mean(&pre),
            mean_ventilation: mean(&vent),
            mean_post_ventilation: mean(&post),
            mean_post_icu_stay: mean(&post_icu),
            bed_utilization: bed_usage.utilization(elapsed),
            ventilator_utilization: ventilator_usage.utilization(elapsed),
            bed_usage,
            ventilator_usage,
        }
    }

    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::LengthOfStay => self.mean_length_of_stay,
            Metric::LengthOfStayP90 => self.length_of_stay_p90,
            Metric::BedWait => self.mean_bed_wait,
            Metric::VentilatorWait => self.mean_ventilator_wait,
            Metric::PreVentilation => self.mean_pre_ventilation,
            Metric::Ventilation => self.mean_ventilation,
            Metric::PostVentilation => self.mean_post_ventilation,
            Metric::PostIcuStay => self.mean_post_icu_stay,
            Metric::BedUtilization => self.bed_utilization,
            Metric::VentilatorUtilization => self.ventilator_utilization,
            Metric::Arrivals => self.arrivals as f64,
            Metric::Completed => self.completed as f64,
            Metric::Censored => self.censored as f64,
            Metric::Rejected => self.rejected as f64,
            Metric::BlockedForBed => self.blocked_for_bed as f64,
            Metric::BlockedForVentilator => self.blocked_for_ventilator as f64,
            Metric::Mortality => {
                if self.completed == 0 {
                    0.0
                } else {
                    self.deceased as f64 / self.completed as f64
                }
            }
        }
    }
}

/// Everything one replication produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub replication: usize,
    pub seed: u64,
    pub end_time: f64,
    pub events_processed: u64,
    pub patients: Vec<Patient>,
    pub metrics: RunMetrics,
}

impl RunResult {
    pub fn metric(&self, metric: Metric) -> f64 {
        self.metrics.value(metric)
    }

    pub fn censored(&self) -> impl Iterator<Item = &Patient> {
        self.patients.iter().filter(|p| p.outcome == Outcome::Censored)
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        let mean_val = mean(values);
        let variance = values.iter().map(|v| (v - mean_val).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;
        variance.sqrt()
    }
}

/// Linear-interpolated percentile of already sorted values.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = pct.clamp(0.0, 100.0) / 100.0 * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let frac = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * frac
        }
    }
}
