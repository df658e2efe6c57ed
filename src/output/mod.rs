use crate::error::SimResult;
use crate::experiment::{Experiment, MetricSummary, ReplicationFailure};
use crate::simulation::Metric;
use crate::stats::validation::ValidationReport;
use crate::stats::ComparisonReport;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub replications: usize,
    pub failed: usize,
    pub summaries: Vec<MetricSummary>,
    pub failures: Vec<ReplicationFailure>,
}

impl ScenarioReport {
    pub fn from_experiment(experiment: &Experiment, metrics: &[Metric], confidence: f64) -> SimResult<Self> {
        let summaries = metrics
            .iter()
            .map(|&metric| experiment.summary(metric, confidence))
            .collect::<SimResult<Vec<_>>>()?;

        Ok(Self {
            name: experiment.name().to_string(),
            replications: experiment.replication_count(),
            failed: experiment.failed_count(),
            summaries,
            failures: experiment.failures().to_vec(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub master_seed: u64,
    pub significance_level: f64,
    pub scenarios: Vec<ScenarioReport>,
    pub comparisons: Vec<ComparisonReport>,
    #[serde(default)]
    pub validation: Option<ValidationReport>,
}

pub fn save_results<P: AsRef<Path>>(experiments: &[Experiment], report: &Report, output_dir: P) -> SimResult<()> {
    let output_path = output_dir.as_ref();

    // Save per-replication metrics
    save_replication_table(experiments, &output_path.join("replications.csv"))?;

    // Save summaries and comparisons
    save_report(report, &output_path.join("report.json"))?;

    // Save readable digest
    generate_summary(report, &output_path.join("summary.md"))?;

    info!("All results saved to {:?}", output_path);
    Ok(())
}

/// One row per scenario and replication, one column per metric.
pub fn save_replication_table<P: AsRef<Path>>(experiments: &[Experiment], path: P) -> SimResult<()> {
    let mut writer = csv::Writer::from_path(path)?;

    // Write header
    let mut header = vec!["scenario", "replication", "seed", "end_time", "events"];
    header.extend(Metric::ALL.iter().map(|m| m.label()));
    writer.write_record(&header)?;

    // Write data
    for experiment in experiments {
        for result in experiment.results() {
            let mut record = vec![
                experiment.name().to_string(),
                result.replication.to_string(),
                result.seed.to_string(),
                result.end_time.to_string(),
                result.events_processed.to_string(),
            ];
            record.extend(Metric::ALL.iter().map(|&m| result.metric(m).to_string()));
            writer.write_record(&record)?;
        }
    }

    writer.flush()?;
    Ok(())
}

pub fn save_report<P: AsRef<Path>>(report: &Report, path: P) -> SimResult<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

/// Human-readable digest of a report.
pub fn generate_summary<P: AsRef<Path>>(report: &Report, path: P) -> SimResult<()> {
    let mut content = format!(
        "# ICU Capacity Simulation Report\n\n- **Generated**: {}\n- **Master seed**: {}\n- **Significance level**: {}\n",
        report.generated_at.to_rfc3339(),
        report.master_seed,
        report.significance_level,
    );

    for scenario in &report.scenarios {
        content.push_str(&format!(
            "\n## {}\n{} replications, {} failed\n\n| Metric | Mean | SD | CI |\n|---|---|---|---|\n",
            scenario.name, scenario.replications, scenario.failed
        ));
        for summary in &scenario.summaries {
            content.push_str(&format!(
                "| {} | {:.3} | {:.3} | [{:.3}, {:.3}] |\n",
                summary.metric, summary.mean, summary.std_dev, summary.ci_lower, summary.ci_upper
            ));
        }
    }

    if !report.comparisons.is_empty() {
        content.push_str("\n## Comparisons\n");
        for comparison in &report.comparisons {
            content.push_str(&format!("- {} ({})\n", comparison, comparison.labels.join(" vs ")));
        }
    }

    if let Some(validation) = &report.validation {
        content.push_str(&format!(
            "\n## Validation against cohort\n{} observed, {} simulated patients\n\n| Variable | Coverage | RMSE | MAE | KS D | KS p | AD | AD p |\n|---|---|---|---|---|---|---|---|\n",
            validation.observed_patients, validation.simulated_patients
        ));
        for v in &validation.per_variable {
            let coverage = v.coverage.map_or("-".to_string(), |c| format!("{:.1}%", c));
            let (rmse, mae) = v
                .error_margin
                .as_ref()
                .map_or(("-".to_string(), "-".to_string()), |m| {
                    (format!("{:.2}", m.rmse), format!("{:.2}", m.mae))
                });
            let (ad, ad_p) = v
                .anderson_darling
                .as_ref()
                .map_or(("-".to_string(), "-".to_string()), |a| {
                    (format!("{:.3}", a.statistic), format!("{:.3}", a.significance_level))
                });
            content.push_str(&format!(
                "| {} | {} | {} | {} | {:.3} | {:.3} | {} | {} |\n",
                v.variable, coverage, rmse, mae, v.ks.statistic, v.ks.p_value, ad, ad_p
            ));
        }
        content.push_str(&format!(
            "\nOverall KS: D={:.3}, p={:.3}\n",
            validation.overall_ks.statistic, validation.overall_ks.p_value
        ));
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::poisson_config;
    use crate::stats::compare_experiments;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("icu_sim_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_save_results_writes_all_files() {
        let mut config = poisson_config(0.15, 6, 3);
        config.experiment.replications = 3;
        let base = Experiment::run("base", &config).unwrap();
        config.resources.bed_capacity = 12;
        let more = Experiment::run("more-beds", &config).unwrap();

        let metrics = Metric::DEFAULT_COMPARISON;
        let report = Report {
            generated_at: Utc::now(),
            master_seed: 42,
            significance_level: 0.05,
            scenarios: vec![
                ScenarioReport::from_experiment(&base, &metrics, 0.95).unwrap(),
                ScenarioReport::from_experiment(&more, &metrics, 0.95).unwrap(),
            ],
            comparisons: vec![compare_experiments(&[&base, &more], Metric::BedWait, 0.05).unwrap()],
            validation: None,
        };

        let dir = scratch_dir("save");
        save_results(&[base, more], &report, &dir).unwrap();

        let mut reader = csv::Reader::from_path(dir.join("replications.csv")).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 5 + Metric::ALL.len());
        assert_eq!(&headers[5], "length_of_stay");
        assert_eq!(reader.records().count(), 6);

        let json = std::fs::read_to_string(dir.join("report.json")).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scenarios.len(), 2);
        assert_eq!(parsed.comparisons[0].metric, Metric::BedWait);

        let summary = std::fs::read_to_string(dir.join("summary.md")).unwrap();
        assert!(summary.contains("## more-beds"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
