use super::metrics::{RunMetrics, RunResult};
use super::patient::{Patient, PatientProcess, PatientState, Suspend};
use super::scheduler::{Event, EventTarget, Scheduler};
use crate::classifier::{Classifier, ClusterId, PatientFeatures};
use crate::config::{ArrivalConfig, CaseMix, Config};
use crate::error::{SimError, SimResult};
use crate::resources::{Grant, Ward};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand::distributions::WeightedIndex;
use rand_distr::{Distribution, Exp};

enum ArrivalStream {
    Poisson(Exp<f64>),
    Scheduled { times: Vec<(f64, ClusterId)>, next: usize },
}

impl ArrivalStream {
    fn from_config(config: &ArrivalConfig) -> SimResult<Self> {
        match config {
            ArrivalConfig::Poisson { rate } => Exp::new(*rate)
                .map(ArrivalStream::Poisson)
                .map_err(|e| SimError::InvalidParameter(format!("arrival rate: {}", e))),
            ArrivalConfig::Scheduled { arrivals } => {
                let mut times: Vec<(f64, ClusterId)> =
                    arrivals.iter().map(|a| (a.time, a.cluster)).collect();
                // Stable sort keeps log order for simultaneous arrivals.
                times.sort_by(|a, b| a.0.total_cmp(&b.0));
                Ok(ArrivalStream::Scheduled { times, next: 0 })
            }
        }
    }

    fn next_time<R: Rng + ?Sized>(&self, now: f64, rng: &mut R) -> Option<f64> {
        match self {
            ArrivalStream::Poisson(exp) => Some(now + exp.sample(rng)),
            ArrivalStream::Scheduled { times, next } => times.get(*next).map(|(t, _)| *t),
        }
    }
}

enum CaseSource<'a> {
    Weighted(WeightedIndex<f64>),
    Cohort {
        records: &'a [PatientFeatures],
        classifier: &'a dyn Classifier,
    },
}

/// One simulated horizon for one configuration and seed.
pub struct SingleRun<'a> {
    config: &'a Config,
    replication: usize,
    seed: u64,
    rng: StdRng,
    scheduler: Scheduler,
    ward: Ward,
    processes: Vec<PatientProcess>,
    arrivals: ArrivalStream,
    cases: CaseSource<'a>,
    wakeups: Vec<Grant>,
}

impl<'a> SingleRun<'a> {
    pub fn new(
        config: &'a Config,
        classifier: Option<&'a dyn Classifier>,
        replication: usize,
        seed: u64,
    ) -> SimResult<Self> {
        config.validate()?;

        let cases = match (&config.case_mix, classifier) {
            (CaseMix::Weighted, _) => {
                let index = WeightedIndex::new(config.clusters.iter().map(|c| c.weight))
                    .map_err(|e| SimError::InvalidParameter(format!("cluster weights: {}", e)))?;
                CaseSource::Weighted(index)
            }
            (CaseMix::Cohort { records, .. }, Some(classifier)) => CaseSource::Cohort {
                records,
                classifier,
            },
            (CaseMix::Cohort { .. }, None) => {
                return Err(SimError::InvalidParameter(
                    "cohort case mix requires a classifier".to_string(),
                ))
            }
        };

        let mut run = Self {
            config,
            replication,
            seed,
            rng: StdRng::seed_from_u64(seed),
            scheduler: Scheduler::new(),
            ward: Ward::new(
                config.resources.bed_capacity,
                config.resources.ventilator_capacity,
                config.resources.bed_queue_limit,
            ),
            processes: Vec::new(),
            arrivals: ArrivalStream::from_config(&config.arrivals)?,
            cases,
            wakeups: Vec::new(),
        };
        debug!(
            "Replication {} (seed {}) starting, horizon {}",
            replication, seed, config.simulation.horizon
        );
        run.schedule_next_arrival()?;
        Ok(run)
    }

    pub fn run(mut self) -> SimResult<RunResult> {
        while self.step()?.is_some() {}
        Ok(self.finish())
    }

    /// Dispatch the next event before the horizon, if any.
    pub fn step(&mut self) -> SimResult<Option<Event>> {
        let Some(event) = self.scheduler.next_until(self.config.simulation.horizon) else {
            return Ok(None);
        };
        match event.target {
            EventTarget::Arrival => self.on_arrival(event.time)?,
            EventTarget::Patient(id) => self.resume(id, event.time)?,
        }
        Ok(Some(event))
    }

    /// Close the run and aggregate its metrics.
    pub fn finish(mut self) -> RunResult {
        let horizon = self.config.simulation.horizon;

        // Anyone still in the ward keeps holding resources until the horizon.
        let in_flight = self
            .processes
            .iter()
            .any(|p| p.state() != PatientState::Departed);
        let end_time = if self.scheduler.pending() > 0 || in_flight {
            horizon
        } else {
            self.scheduler.now()
        };
        self.ward.observe(end_time);

        let patients: Vec<Patient> = self
            .processes
            .into_iter()
            .map(PatientProcess::into_patient)
            .collect();
        let metrics = RunMetrics::from_patients(
            &patients,
            self.ward.beds.usage().clone(),
            self.ward.ventilators.usage().clone(),
            end_time,
        );

        debug!(
            "Replication {} finished at {:.1}: {} arrivals, {} completed, {} censored",
            self.replication, end_time, metrics.arrivals, metrics.completed, metrics.censored
        );

        RunResult {
            replication: self.replication,
            seed: self.seed,
            end_time,
            events_processed: self.scheduler.dispatched(),
            patients,
            metrics,
        }
    }

    fn schedule_next_arrival(&mut self) -> SimResult<()> {
        if let Some(time) = self.arrivals.next_time(self.scheduler.now(), &mut self.rng) {
            self.scheduler.schedule(time, EventTarget::Arrival)?;
        }
        Ok(())
    }

    fn on_arrival(&mut self, now: f64) -> SimResult<()> {
        let id = self.processes.len();

        let (cluster, features) = match &mut self.arrivals {
            ArrivalStream::Scheduled { times, next } => {
                let cluster = times[*next].1;
                *next += 1;
                (cluster, None)
            }
            ArrivalStream::Poisson(_) => match &self.cases {
                CaseSource::Weighted(index) => (index.sample(&mut self.rng), None),
                CaseSource::Cohort { records, classifier } => {
                    let record = &records[self.rng.gen_range(0..records.len())];
                    (classifier.classify(record), Some(record))
                }
            },
        };

        let profile = self.config.clusters.get(cluster).ok_or_else(|| {
            SimError::Simulation(format!("patient {} assigned unknown cluster {}", id, cluster))
        })?;
        let patient = Patient::arrive(id, cluster, profile, features, now, &mut self.rng)?;
        debug!("t={:.2} patient {} arrives (cluster {})", now, id, cluster);

        self.processes.push(PatientProcess::new(patient));
        self.resume(id, now)?;
        self.schedule_next_arrival()
    }

    fn resume(&mut self, id: usize, now: f64) -> SimResult<()> {
        let process = self
            .processes
            .get_mut(id)
            .ok_or_else(|| SimError::Simulation(format!("no process for patient {}", id)))?;

        match process.advance(now, &mut self.ward, &mut self.wakeups)? {
            Suspend::Timed(delay) => self.scheduler.schedule_in(delay, EventTarget::Patient(id))?,
            Suspend::Blocked(_) | Suspend::Finished => {}
        }

        // Units released during this step go to the longest waiters, who resume now.
        for grant in std::mem::take(&mut self.wakeups) {
            let waiter = self.processes.get_mut(grant.requester).ok_or_else(|| {
                SimError::Simulation(format!("grant for unknown patient {}", grant.requester))
            })?;
            waiter.grant(grant.token)?;
            self.scheduler
                .schedule(now, EventTarget::Patient(grant.requester))?;
        }

        Ok(())
    }
}

/// Run one replication of `config` with `seed`.
pub fn single_run(
    config: &Config,
    classifier: Option<&dyn Classifier>,
    replication: usize,
    seed: u64,
) -> SimResult<RunResult> {
    SingleRun::new(config, classifier, replication, seed)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::sample_features;
    use crate::classifier::{FeatureBounds, NearestCentroid};
    use approx::assert_relative_eq;
    use crate::config::tests::{poisson_config, scheduled_config};
    use crate::distributions::Distribution;
    use crate::simulation::patient::Outcome;
    use crate::simulation::Metric;

    #[test]
    fn test_fifo_under_saturation() {
        let config = scheduled_config(&[0.0, 1.0], 5.0, 1, 100.0);
        let result = single_run(&config, None, 0, 1).unwrap();

        let first = &result.patients[0];
        let second = &result.patients[1];
        assert_eq!(first.admitted_at, Some(0.0));
        assert_eq!(first.departure, Some(5.0));
        assert!(second.admitted_at.unwrap() >= 5.0);
        assert_eq!(second.departure, Some(10.0));
        assert_eq!(result.metrics.completed, 2);
        assert_eq!(result.metrics.blocked_for_bed, 1);
        assert_eq!(result.metrics.mean_bed_wait, 2.0);
        assert_eq!(result.end_time, 10.0);
    }

    #[test]
    fn test_horizon_censors_in_flight_patient() {
        let config = scheduled_config(&[10.0, 99.0], 10.0, 1, 100.0);
        let result = single_run(&config, None, 0, 1).unwrap();

        assert_eq!(result.patients.len(), 2);
        let late = &result.patients[1];
        assert_eq!(late.outcome, Outcome::Censored);
        assert_eq!(late.departure, None);
        assert_eq!(late.final_state, PatientState::PostVentilationStay);
        assert_eq!(result.metrics.completed, 1);
        assert_eq!(result.metrics.censored, 1);
        assert_eq!(result.end_time, 100.0);
        assert_eq!(result.censored().count(), 1);
    }

    #[test]
    fn test_zero_capacity_waits_until_horizon() {
        let config = scheduled_config(&[0.0, 1.0], 5.0, 0, 50.0);
        let result = single_run(&config, None, 0, 1).unwrap();

        assert!(result
            .patients
            .iter()
            .all(|p| p.outcome == Outcome::Censored && p.final_state == PatientState::WaitingForBed));
        assert_eq!(result.metric(Metric::BedUtilization), 0.0);
    }

    #[test]
    fn test_bed_held_until_horizon_when_queue_drains() {
        let mut config = scheduled_config(&[10.0], 50.0, 1, 100.0);
        config.resources.ventilator_capacity = 0;
        config.clusters[0].ventilation_probability = 1.0;
        config.clusters[0].ventilation = Distribution::Fixed { value: 5.0 };
        let result = single_run(&config, None, 0, 1).unwrap();

        let patient = &result.patients[0];
        assert_eq!(patient.outcome, Outcome::Censored);
        assert_eq!(patient.final_state, PatientState::WaitingForVentilator);
        assert_eq!(result.end_time, 100.0);
        assert_relative_eq!(result.metrics.bed_usage.busy_area, 90.0);
        assert_relative_eq!(result.metric(Metric::BedUtilization), 0.9);
    }

    #[test]
    fn test_unvalidated_config_is_an_error() {
        let mut config = scheduled_config(&[0.0], 5.0, 1, 100.0);
        config.clusters[0].mortality_probability = 1.5;
        assert!(matches!(
            single_run(&config, None, 0, 1),
            Err(SimError::InvalidParameter(_))
        ));

        let mut config = poisson_config(0.2, 10, 5);
        config.case_mix = CaseMix::Cohort {
            records: vec![],
            centroids: vec![vec![0.0; 11]],
            bounds: FeatureBounds::default(),
        };
        let classifier = NearestCentroid::new(&[vec![0.0; 11]]).unwrap();
        assert!(SingleRun::new(&config, Some(&classifier as &dyn Classifier), 0, 1).is_err());
    }

    #[test]
    fn test_events_dispatched_in_time_order() {
        let config = poisson_config(0.3, 4, 2);
        let mut run = SingleRun::new(&config, None, 0, 21).unwrap();

        let mut times = Vec::new();
        while let Some(event) = run.step().unwrap() {
            times.push(event.time);
        }
        assert!(times.len() > 100);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times.iter().all(|&t| t <= config.simulation.horizon));

        let result = run.finish();
        assert_eq!(result.events_processed, times.len() as u64);
        assert_eq!(result, single_run(&config, None, 0, 21).unwrap());
    }

    #[test]
    fn test_queue_limit_rejects_arrivals() {
        let mut config = scheduled_config(&[0.0, 0.0, 0.0, 0.0], 5.0, 1, 100.0);
        config.resources.bed_queue_limit = Some(1);
        let result = single_run(&config, None, 0, 1).unwrap();

        assert_eq!(result.metrics.rejected, 2);
        assert_eq!(result.metrics.completed, 2);
        assert_eq!(result.patients[2].outcome, Outcome::Rejected);
    }

    #[test]
    fn test_same_seed_is_bit_identical() {
        let config = poisson_config(0.15, 6, 3);
        let a = single_run(&config, None, 0, 77).unwrap();
        let b = single_run(&config, None, 0, 77).unwrap();

        assert_eq!(a, b);
        for metric in Metric::ALL {
            assert_eq!(a.metric(metric).to_bits(), b.metric(metric).to_bits());
        }

        let c = single_run(&config, None, 0, 78).unwrap();
        assert_ne!(a.patients, c.patients);
    }

    #[test]
    fn test_same_seed_same_patients_across_capacities() {
        let small = poisson_config(0.15, 3, 1);
        let large = poisson_config(0.15, 30, 15);
        let a = single_run(&small, None, 0, 5).unwrap();
        let b = single_run(&large, None, 0, 5).unwrap();

        let n = a.patients.len().min(b.patients.len());
        assert!(n > 10);
        for (x, y) in a.patients.iter().zip(b.patients.iter()).take(n) {
            assert_eq!(x.arrival, y.arrival);
            assert_eq!(x.durations, y.durations);
            assert_eq!(x.cluster, y.cluster);
        }
        assert!(a.metrics.mean_bed_wait >= b.metrics.mean_bed_wait);
    }

    #[test]
    fn test_occupancy_within_capacity() {
        let config = poisson_config(0.3, 4, 2);
        let result = single_run(&config, None, 0, 9).unwrap();

        assert!(result.metrics.bed_usage.peak_occupancy <= 4);
        assert!(result.metrics.ventilator_usage.peak_occupancy <= 2);
        assert!(result.metrics.bed_utilization <= 1.0 + 1e-12);
        assert!(result.metrics.ventilator_utilization <= 1.0 + 1e-12);
        assert!(result.metrics.blocked_for_bed > 0);
    }

    #[test]
    fn test_cohort_case_mix_uses_classifier() {
        let mut config = poisson_config(0.2, 10, 5);
        let mut features = sample_features().to_vector().to_vec();
        let far = vec![1e6; features.len()];
        features.extend([0.0; 7]);
        config.case_mix = CaseMix::Cohort {
            records: vec![sample_features()],
            centroids: vec![far, features],
            bounds: FeatureBounds::default(),
        };
        config.validate().unwrap();

        let classifier = config.classifier().unwrap().unwrap();
        let result = single_run(&config, Some(&classifier as &dyn Classifier), 0, 3).unwrap();
        assert!(!result.patients.is_empty());
        assert!(result.patients.iter().all(|p| p.cluster == 1));
        // The cohort record is ventilated, so every admitted patient asks for a ventilator.
        assert!(result
            .patients
            .iter()
            .all(|p| p.durations.ventilation.is_some()));

        assert!(single_run(&config, None, 0, 3).is_err());
    }

    #[test]
    fn test_run_result_json_round_trip() {
        let config = poisson_config(0.2, 5, 2);
        let result = single_run(&config, None, 0, 11).unwrap();

        let json = serde_json::to_string(&result).unwrap();
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        for metric in Metric::ALL {
            assert_eq!(back.metric(metric).to_bits(), result.metric(metric).to_bits());
        }
    }
}
