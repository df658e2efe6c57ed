use crate::error::{SimError, SimResult};
use crate::resources::PatientId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Arrival,
    Patient(PatientId),
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub time: f64,
    pub seq: u64,
    pub target: EventTarget,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl Ord for Event {
    // Reversed so the max-heap pops the earliest (time, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Simulation clock plus pending-event queue.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: f64,
    next_seq: u64,
    dispatched: u64,
    queue: BinaryHeap<Event>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn schedule(&mut self, time: f64, target: EventTarget) -> SimResult<()> {
        if !time.is_finite() {
            return Err(SimError::Scheduling(format!(
                "non-finite event time {} for {:?}",
                time, target
            )));
        }
        if time < self.now {
            return Err(SimError::Scheduling(format!(
                "event at {} scheduled in the past (now {}) for {:?}",
                time, self.now, target
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Event { time, seq, target });
        Ok(())
    }

    pub fn schedule_in(&mut self, delay: f64, target: EventTarget) -> SimResult<()> {
        self.schedule(self.now + delay, target)
    }

    /// Pop the next event unless it lies beyond `horizon`; advances the clock.
    pub fn next_until(&mut self, horizon: f64) -> Option<Event> {
        match self.queue.peek() {
            Some(top) if top.time <= horizon => {}
            _ => return None,
        }
        let event = self.queue.pop()?;
        debug_assert!(event.time >= self.now);
        self.now = event.time;
        self.dispatched += 1;
        Some(event)
    }
}
