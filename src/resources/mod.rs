//! Finite-capacity shared resources with FIFO contention.

use crate::error::{SimError, SimResult};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

pub type PatientId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Bed,
    Ventilator,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Bed => write!(f, "bed"),
            ResourceKind::Ventilator => write!(f, "ventilator"),
        }
    }
}

/// Proof of holding one unit of a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub kind: ResourceKind,
    pub serial: u64,
    pub holder: PatientId,
    pub acquired_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    Granted(Token),
    Queued,
    /// Queue limit reached; the request was not enqueued.
    Rejected,
}

/// A unit handed to a waiting requester on release.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grant {
    pub requester: PatientId,
    pub requested_at: f64,
    pub token: Token,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    requester: PatientId,
    requested_at: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub capacity: usize,
    /// Integral of occupancy over time.
    pub busy_area: f64,
    pub peak_occupancy: usize,
    pub peak_queue: usize,
    pub acquisitions: usize,
    pub queued_requests: usize,
    pub rejected_requests: usize,
}

impl PoolUsage {
    pub fn utilization(&self, elapsed: f64) -> f64 {
        if self.capacity == 0 || elapsed <= 0.0 {
            0.0
        } else {
            self.busy_area / (self.capacity as f64 * elapsed)
        }
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    kind: ResourceKind,
    capacity: usize,
    queue_limit: Option<usize>,
    held: HashMap<u64, PatientId>,
    queue: VecDeque<Waiter>,
    next_serial: u64,
    last_change: f64,
    usage: PoolUsage,
}

impl ResourcePool {
    pub fn new(kind: ResourceKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            queue_limit: None,
            held: HashMap::new(),
            queue: VecDeque::new(),
            next_serial: 0,
            last_change: 0.0,
            usage: PoolUsage {
                capacity,
                ..PoolUsage::default()
            },
        }
    }

    pub fn with_queue_limit(mut self, limit: Option<usize>) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.held.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn usage(&self) -> &PoolUsage {
        &self.usage
    }

    pub fn request(&mut self, requester: PatientId, now: f64) -> Acquire {
        self.observe(now);

        if self.held.len() < self.capacity {
            let token = self.issue(requester, now);
            trace!("{} {} granted to patient {} at {}", self.kind, token.serial, requester, now);
            return Acquire::Granted(token);
        }

        if let Some(limit) = self.queue_limit {
            if self.queue.len() >= limit {
                self.usage.rejected_requests += 1;
                return Acquire::Rejected;
            }
        }

        self.queue.push_back(Waiter {
            requester,
            requested_at: now,
        });
        self.usage.queued_requests += 1;
        self.usage.peak_queue = self.usage.peak_queue.max(self.queue.len());
        trace!("patient {} queued for {} at {}", requester, self.kind, now);
        self.check_invariants();

        Acquire::Queued
    }

    /// Free one unit; the longest waiter, if any, receives it immediately.
    pub fn release(&mut self, token: Token, now: f64) -> SimResult<Option<Grant>> {
        if token.kind != self.kind {
            return Err(SimError::ResourceMisuse(format!(
                "{} token {} released into {} pool",
                token.kind, token.serial, self.kind
            )));
        }
        match self.held.get(&token.serial) {
            Some(&holder) if holder == token.holder => {}
            Some(&holder) => {
                return Err(SimError::ResourceMisuse(format!(
                    "{} token {} held by patient {}, released by patient {}",
                    self.kind, token.serial, holder, token.holder
                )))
            }
            None => {
                return Err(SimError::ResourceMisuse(format!(
                    "{} token {} is not held (double release or foreign token)",
                    self.kind, token.serial
                )))
            }
        }

        self.observe(now);
        self.held.remove(&token.serial);

        let grant = self.queue.pop_front().map(|waiter| {
            let token = self.issue(waiter.requester, now);
            Grant {
                requester: waiter.requester,
                requested_at: waiter.requested_at,
                token,
            }
        });
        self.check_invariants();

        Ok(grant)
    }

    /// Advance the busy-time integral to `now`.
    pub fn observe(&mut self, now: f64) {
        if now > self.last_change {
            self.usage.busy_area += self.held.len() as f64 * (now - self.last_change);
            self.last_change = now;
        }
    }

    fn issue(&mut self, requester: PatientId, now: f64) -> Token {
        let token = Token {
            kind: self.kind,
            serial: self.next_serial,
            holder: requester,
            acquired_at: now,
        };
        self.next_serial += 1;
        self.held.insert(token.serial, requester);
        self.usage.acquisitions += 1;
        self.usage.peak_occupancy = self.usage.peak_occupancy.max(self.held.len());
        token
    }

    fn check_invariants(&self) {
        debug_assert!(self.held.len() <= self.capacity);
        debug_assert!(self.queue.is_empty() || self.held.len() == self.capacity);
    }
}

/// The shared resources of one ICU run.
#[derive(Debug)]
pub struct Ward {
    pub beds: ResourcePool,
    pub ventilators: ResourcePool,
}

impl Ward {
    pub fn new(beds: usize, ventilators: usize, bed_queue_limit: Option<usize>) -> Self {
        Self {
            beds: ResourcePool::new(ResourceKind::Bed, beds).with_queue_limit(bed_queue_limit),
            ventilators: ResourcePool::new(ResourceKind::Ventilator, ventilators),
        }
    }

    pub fn pool_mut(&mut self, kind: ResourceKind) -> &mut ResourcePool {
        match kind {
            ResourceKind::Bed => &mut self.beds,
            ResourceKind::Ventilator => &mut self.ventilators,
        }
    }

    pub fn release(&mut self, token: Token, now: f64) -> SimResult<Option<Grant>> {
        self.pool_mut(token.kind).release(token, now)
    }

    pub fn observe(&mut self, now: f64) {
        self.beds.observe(now);
        self.ventilators.observe(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn granted(acquire: Acquire) -> Token {
        match acquire {
            Acquire::Granted(token) => token,
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[test]
    fn test_fifo_handoff() {
        let mut pool = ResourcePool::new(ResourceKind::Bed, 1);
        let first = granted(pool.request(0, 0.0));
        assert_eq!(pool.request(1, 1.0), Acquire::Queued);
        assert_eq!(pool.request(2, 2.0), Acquire::Queued);

        let grant = pool.release(first, 5.0).unwrap().unwrap();
        assert_eq!(grant.requester, 1);
        assert_eq!(grant.requested_at, 1.0);
        assert_eq!(grant.token.acquired_at, 5.0);
        assert_eq!(pool.occupancy(), 1);
        assert_eq!(pool.queue_len(), 1);

        let grant = pool.release(grant.token, 6.0).unwrap().unwrap();
        assert_eq!(grant.requester, 2);
        assert!(pool.release(grant.token, 7.0).unwrap().is_none());
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn test_double_release_is_misuse() {
        let mut pool = ResourcePool::new(ResourceKind::Ventilator, 2);
        let token = granted(pool.request(0, 0.0));
        pool.release(token, 1.0).unwrap();

        assert!(matches!(
            pool.release(token, 2.0),
            Err(SimError::ResourceMisuse(_))
        ));
    }

    #[test]
    fn test_foreign_token_is_misuse() {
        let mut beds = ResourcePool::new(ResourceKind::Bed, 1);
        let mut vents = ResourcePool::new(ResourceKind::Ventilator, 1);
        let bed = granted(beds.request(0, 0.0));
        let _vent = granted(vents.request(0, 0.0));

        assert!(matches!(vents.release(bed, 1.0), Err(SimError::ResourceMisuse(_))));

        let mut forged = bed;
        forged.holder = 9;
        assert!(matches!(beds.release(forged, 1.0), Err(SimError::ResourceMisuse(_))));

        forged = bed;
        forged.serial = 42;
        assert!(matches!(beds.release(forged, 1.0), Err(SimError::ResourceMisuse(_))));
    }

    #[test]
    fn test_queue_limit_rejects() {
        let mut pool = ResourcePool::new(ResourceKind::Bed, 1).with_queue_limit(Some(1));
        granted(pool.request(0, 0.0));
        assert_eq!(pool.request(1, 0.0), Acquire::Queued);
        assert_eq!(pool.request(2, 0.0), Acquire::Rejected);
        assert_eq!(pool.usage().rejected_requests, 1);
    }

    #[test]
    fn test_zero_capacity_queues_forever() {
        let mut pool = ResourcePool::new(ResourceKind::Ventilator, 0);
        assert_eq!(pool.request(0, 0.0), Acquire::Queued);
        assert_eq!(pool.occupancy(), 0);
        assert_eq!(pool.queue_len(), 1);
    }

    #[test]
    fn test_busy_area_and_utilization() {
        let mut pool = ResourcePool::new(ResourceKind::Bed, 2);
        let a = granted(pool.request(0, 0.0));
        let b = granted(pool.request(1, 2.0));
        pool.release(a, 4.0).unwrap();
        pool.release(b, 6.0).unwrap();
        pool.observe(10.0);

        // 1 bed for [0,2), 2 beds for [2,4), 1 bed for [4,6)
        assert_relative_eq!(pool.usage().busy_area, 8.0);
        assert_relative_eq!(pool.usage().utilization(10.0), 0.4);
        assert_eq!(pool.usage().peak_occupancy, 2);
    }

    #[test]
    fn test_random_contention_never_exceeds_capacity() {
        let mut rng = StdRng::seed_from_u64(2024);

        for capacity in 1..6 {
            let mut pool = ResourcePool::new(ResourceKind::Bed, capacity);
            let mut holding: Vec<Token> = Vec::new();
            let mut now = 0.0;

            for requester in 0..2000 {
                now += rng.gen::<f64>();
                if rng.gen_bool(0.55) {
                    if let Acquire::Granted(token) = pool.request(requester, now) {
                        holding.push(token);
                    }
                } else if !holding.is_empty() {
                    let idx = rng.gen_range(0..holding.len());
                    let token = holding.swap_remove(idx);
                    if let Some(grant) = pool.release(token, now).unwrap() {
                        holding.push(grant.token);
                    }
                }

                assert!(pool.occupancy() <= capacity);
                assert_eq!(pool.occupancy(), holding.len());
                assert!(pool.queue_len() == 0 || pool.occupancy() == capacity);
            }
        }
    }
}
