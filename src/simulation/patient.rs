use crate::classifier::{ClusterId, PatientFeatures};
use crate::config::ClusterProfile;
use crate::error::{SimError, SimResult};
use crate::resources::{Acquire, Grant, PatientId, ResourceKind, Token, Ward};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Redraws allowed for a ventilation time longer than the sampled ICU stay.
pub const MAX_VENTILATION_REDRAWS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientState {
    Arrived,
    WaitingForBed,
    Admitted,
    WaitingForVentilator,
    Ventilated,
    PostVentilationStay,
    Departed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Discharged,
    Deceased,
    /// Turned away because the bed queue was full.
    Rejected,
    /// Still in the ICU when the horizon was reached.
    Censored,
}

/// Phase durations drawn at arrival, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub icu_stay: f64,
    pub pre_ventilation: f64,
    pub ventilation: Option<f64>,
    pub post_ventilation: f64,
    pub post_icu: Option<f64>,
}

impl PhaseDurations {
    pub fn draw<R: Rng + ?Sized>(
        profile: &ClusterProfile,
        ventilated: bool,
        rng: &mut R,
    ) -> SimResult<Self> {
        let icu_stay = profile.icu_stay.sample(rng)?;

        let ventilation = if ventilated {
            let mut vent = profile.ventilation.sample(rng)?;
            let mut redraws = 0;
            while vent > icu_stay && redraws < MAX_VENTILATION_REDRAWS {
                vent = profile.ventilation.sample(rng)?;
                redraws += 1;
            }
            Some(vent.min(icu_stay))
        } else {
            None
        };

        let vent = ventilation.unwrap_or(0.0);
        let pre_ventilation = (icu_stay - vent) * profile.pre_ventilation_share / 100.0;
        let post_ventilation = (icu_stay - pre_ventilation - vent).max(0.0);

        let post_icu = match &profile.post_icu_stay {
            Some(dist) => Some(dist.sample(rng)?),
            None => None,
        };

        Ok(Self {
            icu_stay,
            pre_ventilation,
            ventilation,
            post_ventilation,
            post_icu,
        })
    }
}

/// One patient's journey. Owned by its process until the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub cluster: ClusterId,
    pub arrival: f64,
    pub durations: PhaseDurations,
    pub deceased: bool,
    pub admitted_at: Option<f64>,
    pub ventilation_requested_at: Option<f64>,
    pub ventilation_started_at: Option<f64>,
    pub ventilation_ended_at: Option<f64>,
    pub departure: Option<f64>,
    pub outcome: Outcome,
    pub final_state: PatientState,
}

impl Patient {
    /// Draw a new arrival. Every random draw for the patient happens here.
    pub fn arrive<R: Rng + ?Sized>(
        id: PatientId,
        cluster: ClusterId,
        profile: &ClusterProfile,
        features: Option<&PatientFeatures>,
        now: f64,
        rng: &mut R,
    ) -> SimResult<Self> {
        let ventilated = match features {
            Some(features) => features.is_ventilated(),
            None => rng.gen_bool(profile.ventilation_probability),
        };
        let durations = PhaseDurations::draw(profile, ventilated, rng)?;
        let deceased = rng.gen_bool(profile.mortality_probability);

        Ok(Self {
            id,
            cluster,
            arrival: now,
            durations,
            deceased,
            admitted_at: None,
            ventilation_requested_at: None,
            ventilation_started_at: None,
            ventilation_ended_at: None,
            departure: None,
            outcome: Outcome::Censored,
            final_state: PatientState::Arrived,
        })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Discharged | Outcome::Deceased)
    }

    pub fn length_of_stay(&self) -> Option<f64> {
        match (self.is_completed(), self.departure) {
            (true, Some(departure)) => Some(departure - self.arrival),
            _ => None,
        }
    }

    pub fn bed_wait(&self) -> Option<f64> {
        self.admitted_at.map(|t| t - self.arrival)
    }

    pub fn ventilator_wait(&self) -> Option<f64> {
        match (self.ventilation_requested_at, self.ventilation_started_at) {
            (Some(requested), Some(started)) => Some(started - requested),
            _ => None,
        }
    }
}

/// Why a process handed control back to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Suspend {
    /// Resume after this many hours.
    Timed(f64),
    /// Waiting in a resource queue; resumed by a release hand-off.
    Blocked(ResourceKind),
    Finished,
}

#[derive(Debug)]
pub struct PatientProcess {
    patient: Patient,
    state: PatientState,
    bed: Option<Token>,
    ventilator: Option<Token>,
}

impl PatientProcess {
    pub fn new(patient: Patient) -> Self {
        Self {
            patient,
            state: PatientState::Arrived,
            bed: None,
            ventilator: None,
        }
    }

    pub fn state(&self) -> PatientState {
        self.state
    }

    pub fn patient(&self) -> &Patient {
        &self.patient
    }

    /// Receive a unit handed off by a releasing process.
    pub fn grant(&mut self, token: Token) -> SimResult<()> {
        let (slot, expected) = match token.kind {
            ResourceKind::Bed => (&mut self.bed, PatientState::WaitingForBed),
            ResourceKind::Ventilator => (&mut self.ventilator, PatientState::WaitingForVentilator),
        };
        if self.state != expected || slot.is_some() || token.holder != self.patient.id {
            return Err(SimError::ResourceMisuse(format!(
                "patient {} in state {:?} cannot accept {} token {}",
                self.patient.id, self.state, token.kind, token.serial
            )));
        }
        *slot = Some(token);
        Ok(())
    }

    /// Perform transitions until the next suspension point.
    pub fn advance(
        &mut self,
        now: f64,
        ward: &mut Ward,
        wakeups: &mut Vec<Grant>,
    ) -> SimResult<Suspend> {
        loop {
            match self.step(now, ward, wakeups)? {
                Some(suspend) => return Ok(suspend),
                None => continue,
            }
        }
    }

    /// One transition; `None` means the next transition is immediate.
    fn step(
        &mut self,
        now: f64,
        ward: &mut Ward,
        wakeups: &mut Vec<Grant>,
    ) -> SimResult<Option<Suspend>> {
        let id = self.patient.id;
        match self.state {
            PatientState::Arrived => {
                self.enter(PatientState::WaitingForBed, now);
                match ward.beds.request(id, now) {
                    Acquire::Granted(token) => {
                        self.bed = Some(token);
                        Ok(None)
                    }
                    Acquire::Queued => Ok(Some(Suspend::Blocked(ResourceKind::Bed))),
                    Acquire::Rejected => {
                        self.patient.outcome = Outcome::Rejected;
                        self.patient.departure = Some(now);
                        self.enter(PatientState::Departed, now);
                        Ok(Some(Suspend::Finished))
                    }
                }
            }
            PatientState::WaitingForBed => {
                if self.bed.is_none() {
                    return Ok(Some(Suspend::Blocked(ResourceKind::Bed)));
                }
                self.patient.admitted_at = Some(now);
                self.enter(PatientState::Admitted, now);
                Ok(Some(Suspend::Timed(self.patient.durations.pre_ventilation)))
            }
            PatientState::Admitted => {
                if self.patient.durations.ventilation.is_some() {
                    self.patient.ventilation_requested_at = Some(now);
                    self.enter(PatientState::WaitingForVentilator, now);
                    match ward.ventilators.request(id, now) {
                        Acquire::Granted(token) => {
                            self.ventilator = Some(token);
                            Ok(None)
                        }
                        Acquire::Queued | Acquire::Rejected => {
                            Ok(Some(Suspend::Blocked(ResourceKind::Ventilator)))
                        }
                    }
                } else {
                    self.enter(PatientState::PostVentilationStay, now);
                    Ok(Some(Suspend::Timed(self.patient.durations.post_ventilation)))
                }
            }
            PatientState::WaitingForVentilator => {
                if self.ventilator.is_none() {
                    return Ok(Some(Suspend::Blocked(ResourceKind::Ventilator)));
                }
                self.patient.ventilation_started_at = Some(now);
                self.enter(PatientState::Ventilated, now);
                Ok(Some(Suspend::Timed(
                    self.patient.durations.ventilation.unwrap_or(0.0),
                )))
            }
            PatientState::Ventilated => {
                self.release(ResourceKind::Ventilator, now, ward, wakeups)?;
                self.patient.ventilation_ended_at = Some(now);
                self.enter(PatientState::PostVentilationStay, now);
                Ok(Some(Suspend::Timed(self.patient.durations.post_ventilation)))
            }
            PatientState::PostVentilationStay => {
                self.release(ResourceKind::Bed, now, ward, wakeups)?;
                // Normal flow already returned the ventilator.
                if self.ventilator.is_some() {
                    self.release(ResourceKind::Ventilator, now, ward, wakeups)?;
                }
                self.patient.departure = Some(now);
                self.patient.outcome = if self.patient.deceased {
                    Outcome::Deceased
                } else {
                    Outcome::Discharged
                };
                self.enter(PatientState::Departed, now);
                Ok(Some(Suspend::Finished))
            }
            PatientState::Departed => Err(SimError::Simulation(format!(
                "patient {} resumed after departure",
                id
            ))),
        }
    }

    fn release(
        &mut self,
        kind: ResourceKind,
        now: f64,
        ward: &mut Ward,
        wakeups: &mut Vec<Grant>,
    ) -> SimResult<()> {
        let slot = match kind {
            ResourceKind::Bed => &mut self.bed,
            ResourceKind::Ventilator => &mut self.ventilator,
        };
        let token = slot.take().ok_or_else(|| {
            SimError::ResourceMisuse(format!(
                "patient {} releasing a {} it does not hold",
                self.patient.id, kind
            ))
        })?;
        if let Some(grant) = ward.release(token, now)? {
            wakeups.push(grant);
        }
        Ok(())
    }

    fn enter(&mut self, state: PatientState, now: f64) {
        debug!("t={:.2} patient {} {:?} -> {:?}", now, self.patient.id, self.state, state);
        self.state = state;
        self.patient.final_state = state;
    }

    /// Close the record; patients still in flight become censored.
    pub fn into_patient(self) -> Patient {
        let mut patient = self.patient;
        if self.state != PatientState::Departed {
            patient.outcome = Outcome::Censored;
            patient.departure = None;
        }
        patient
    }
}
