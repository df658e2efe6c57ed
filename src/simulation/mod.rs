//! Discrete-event engine: event scheduler, patient processes and single runs.

pub mod metrics;
pub mod patient;
pub mod run;
pub mod scheduler;

pub use metrics::{Metric, RunMetrics, RunResult};
pub use patient::{Outcome, Patient, PatientProcess, PatientState, PhaseDurations, Suspend};
pub use run::{single_run, SingleRun};
pub use scheduler::{Event, EventTarget, Scheduler};
