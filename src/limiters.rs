use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::error::DispatchError;
use crate::util::{lock_unpoisoned, origin_key};

/// Bounded admission primitive.
///
/// Waiters are served strictly in arrival order, and a released permit goes
/// to the oldest waiter before it is returned to the free pool. Dropping a
/// pending [`acquire`](Self::acquire) leaves the queue without taking a
/// permit.
#[derive(Debug)]
pub struct PermitGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Permit held for the lifetime of the guard; dropping it releases it once.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl PermitGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<GatePermit, DispatchError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ConcurrencyLimitClosed)?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn try_acquire(&self) -> Option<GatePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }
}

/// Both permits a physical request runs under.
///
/// Fields drop in declaration order, so the origin permit is released
/// before the global one.
#[derive(Debug)]
pub(crate) struct Admission {
    _origin: GatePermit,
    _global: GatePermit,
    pub(crate) wait_global: Duration,
    pub(crate) wait_origin: Duration,
}

/// One global gate plus one lazily created gate per origin.
///
/// Origin entries live as long as the registry; every dispatcher owns its own.
#[derive(Debug)]
pub(crate) struct OriginRegistry {
    global: PermitGate,
    per_origin_limit: usize,
    per_origin: Mutex<HashMap<String, Arc<PermitGate>>>,
}

impl OriginRegistry {
    pub(crate) fn new(max_concurrency: usize, max_concurrency_per_origin: usize) -> Self {
        Self {
            global: PermitGate::new(max_concurrency),
            per_origin_limit: max_concurrency_per_origin.max(1),
            per_origin: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn global(&self) -> &PermitGate {
        &self.global
    }

    pub(crate) fn gate_for(&self, url: &Url) -> Arc<PermitGate> {
        let key = origin_key(url);
        let mut guard = lock_unpoisoned(&self.per_origin);
        let gate = guard
            .entry(key)
            .or_insert_with(|| Arc::new(PermitGate::new(self.per_origin_limit)));
        Arc::clone(gate)
    }

    pub(crate) fn origin_count(&self) -> usize {
        lock_unpoisoned(&self.per_origin).len()
    }

    /// Acquires the global permit, then the origin permit.
    pub(crate) async fn admit(&self, url: &Url) -> Result<Admission, DispatchError> {
        let global_started_at = Instant::now();
        let global = self.global.acquire().await?;
        let wait_global = global_started_at.elapsed();

        let gate = self.gate_for(url);
        let origin_started_at = Instant::now();
        let origin = gate.acquire().await?;
        let wait_origin = origin_started_at.elapsed();

        Ok(Admission {
            _origin: origin,
            _global: global,
            wait_global,
            wait_origin,
        })
    }
}
