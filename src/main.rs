use anyhow::{Context, Result};
use clap::Parser;
use icu_sim::classifier::Classifier;
use icu_sim::config::{CaseMix, Config};
use icu_sim::experiment::Experiment;
use icu_sim::output::{self, Report, ScenarioReport};
use icu_sim::stats::{compare_experiments, validation};
use log::{info, warn};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "icu_sim")]
#[command(about = "ICU bed and ventilator capacity simulation")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Override the number of replications per scenario
    #[arg(short, long)]
    replications: Option<usize>,

    /// Override the master seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Run replications on the calling thread
    #[arg(long)]
    serial: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Load configuration and apply command-line overrides
    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    if let Some(replications) = cli.replications {
        config.experiment.replications = replications;
    }
    if let Some(seed) = cli.seed {
        config.experiment.master_seed = seed;
    }
    if cli.serial {
        config.experiment.parallel = false;
    }
    config.validate().context("configuration overrides")?;

    info!(
        "Starting ICU simulation: {} scenarios, {} replications each (seed: {})",
        config.scenarios.len() + 1,
        config.experiment.replications,
        config.experiment.master_seed
    );

    // Run the base configuration, then each scenario
    let mut experiments = vec![Experiment::run("base", &config).context("running base configuration")?];
    for scenario in &config.scenarios {
        let scenario_config = config
            .with_scenario(scenario)
            .with_context(|| format!("applying scenario {}", scenario.name))?;
        let experiment = Experiment::run(&scenario.name, &scenario_config)
            .with_context(|| format!("running scenario {}", scenario.name))?;
        experiments.push(experiment);
    }

    let alpha = config.experiment.significance_level;
    let metrics = config.metrics();
    let confidence = 1.0 - alpha;

    // Summarize each experiment
    let scenarios = experiments
        .iter()
        .map(|e| ScenarioReport::from_experiment(e, &metrics, confidence))
        .collect::<Result<Vec<_>, _>>()?;

    // Compare scenarios replication by replication
    let mut comparisons = Vec::new();
    if experiments.len() > 1 {
        let refs: Vec<&Experiment> = experiments.iter().collect();
        for &metric in &metrics {
            let report = compare_experiments(&refs, metric, alpha)
                .with_context(|| format!("comparing scenarios on {}", metric))?;
            println!("{}", report);
            comparisons.push(report);
        }
    } else {
        warn!("No scenarios configured; skipping comparisons");
    }

    // Validate against the cohort when arrivals are drawn from one
    let validation = match (&config.case_mix, config.classifier()?) {
        (CaseMix::Cohort { records, .. }, Some(classifier)) => validation::validate_phases(
            &experiments[0],
            records,
            &classifier as &dyn Classifier,
            confidence,
        )?,
        _ => None,
    };

    let report = Report {
        generated_at: chrono::Utc::now(),
        master_seed: config.experiment.master_seed,
        significance_level: alpha,
        scenarios,
        comparisons,
        validation,
    };

    // Create output directory if it doesn't exist
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating output directory {:?}", cli.output))?;
    output::save_results(&experiments, &report, &cli.output)?;
    info!("Results saved to {:?}", cli.output);

    Ok(())
}
