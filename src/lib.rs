//! Discrete-event simulation of ICU bed and ventilator capacity.
//!
//! A run pushes arriving patients through admission, optional ventilation and
//! discharge against finite pools. Experiments repeat runs under derived seeds,
//! and the `stats` module compares configurations replication by replication.

pub mod classifier;
pub mod config;
pub mod distributions;
pub mod error;
pub mod experiment;
pub mod output;
pub mod resources;
pub mod simulation;
pub mod stats;

pub use config::Config;
pub use error::{SimError, SimResult};
pub use experiment::{derive_seeds, run_replications, Experiment};
pub use simulation::{single_run, Metric, RunResult};
pub use stats::{compare_experiments, ComparisonReport};
