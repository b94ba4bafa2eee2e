//! Operator registry
//!
//! Operators live in an arena of slots addressed by [`OperatorIndex`]. The
//! arena sits behind a read-mostly lock; the live counters are atomics on the
//! entries so the dispatch loops update them without taking the lock.

use parking_lot::RwLock;
use serde::Serialize;
use smsc_core::{OperatorId, OperatorRecord, OperatorStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::RegistryError;

/// Slot of an operator in the arena. Stable for the operator's lifetime; a
/// removed operator's slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorIndex(usize);

impl OperatorIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// One operator with its live counters
#[derive(Debug)]
pub struct OperatorEntry {
    index: OperatorIndex,
    record: RwLock<OperatorRecord>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

impl OperatorEntry {
    fn new(index: OperatorIndex, record: OperatorRecord) -> Self {
        Self {
            index,
            record: RwLock::new(record),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> OperatorIndex {
        self.index
    }

    pub fn record(&self) -> OperatorRecord {
        self.record.read().clone()
    }

    pub fn id(&self) -> OperatorId {
        self.record.read().id.clone()
    }

    pub fn status(&self) -> OperatorStatus {
        self.record.read().status
    }

    pub fn max_tps(&self) -> u32 {
        self.record.read().max_tps
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dequeued(&self) {
        saturating_dec(&self.queued);
    }

    pub fn attempt_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempt_finished(&self) {
        saturating_dec(&self.in_flight);
    }
}

fn saturating_dec(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

/// Point-in-time view of an operator for the admin surface
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OperatorLoad {
    pub id: OperatorId,
    pub name: String,
    pub status: OperatorStatus,
    pub max_tps: u32,
    pub queued: usize,
    pub in_flight: usize,
    pub load: f64,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Arc<OperatorEntry>>>,
    free: Vec<usize>,
    by_id: HashMap<OperatorId, OperatorIndex>,
}

pub struct OperatorRegistry {
    arena: RwLock<Arena>,
    /// Capacity used for operators configured with `max_tps = 0`
    default_tps: u32,
}

impl OperatorRegistry {
    pub fn new(default_tps: u32) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            default_tps,
        }
    }

    pub fn with_operators(
        default_tps: u32,
        operators: impl IntoIterator<Item = OperatorRecord>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(default_tps);
        for operator in operators {
            registry.add(operator)?;
        }
        Ok(registry)
    }

    fn validate(&self, record: &OperatorRecord) -> Result<(), RegistryError> {
        if record.id.as_str().is_empty() {
            return Err(RegistryError::Invalid("operator id is empty".to_string()));
        }
        if record.max_tps == 0 && self.default_tps == 0 {
            return Err(RegistryError::Invalid(format!(
                "operator {} has no max_tps and no rate limit default",
                record.id
            )));
        }
        Ok(())
    }

    pub fn add(&self, record: OperatorRecord) -> Result<OperatorIndex, RegistryError> {
        self.validate(&record)?;
        let mut arena = self.arena.write();
        if arena.by_id.contains_key(&record.id) {
            return Err(RegistryError::DuplicateOperator(record.id));
        }

        let slot = match arena.free.pop() {
            Some(slot) => slot,
            None => {
                arena.slots.push(None);
                arena.slots.len() - 1
            }
        };
        let index = OperatorIndex(slot);
        info!(operator = %record.id, slot, max_tps = record.max_tps, "Operator added");
        arena.by_id.insert(record.id.clone(), index);
        arena.slots[slot] = Some(Arc::new(OperatorEntry::new(index, record)));
        Ok(index)
    }

    /// Replace an operator's definition; live counters are kept
    pub fn update(&self, record: OperatorRecord) -> Result<(), RegistryError> {
        self.validate(&record)?;
        let entry = self
            .get(&record.id)
            .ok_or_else(|| RegistryError::UnknownOperator(record.id.clone()))?;
        info!(operator = %record.id, "Operator updated");
        *entry.record.write() = record;
        Ok(())
    }

    pub fn remove(&self, id: &OperatorId) -> Result<OperatorRecord, RegistryError> {
        let mut arena = self.arena.write();
        let index = arena
            .by_id
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownOperator(id.clone()))?;
        let entry = arena.slots[index.0].take();
        arena.free.push(index.0);
        info!(operator = %id, "Operator removed");
        entry
            .map(|e| e.record())
            .ok_or_else(|| RegistryError::UnknownOperator(id.clone()))
    }

    pub fn set_status(&self, id: &OperatorId, status: OperatorStatus) -> Result<(), RegistryError> {
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownOperator(id.clone()))?;
        entry.record.write().status = status;
        info!(operator = %id, status = status.as_str(), "Operator status changed");
        Ok(())
    }

    pub fn index_of(&self, id: &OperatorId) -> Option<OperatorIndex> {
        self.arena.read().by_id.get(id).copied()
    }

    pub fn entry(&self, index: OperatorIndex) -> Option<Arc<OperatorEntry>> {
        self.arena.read().slots.get(index.0).and_then(|slot| slot.clone())
    }

    pub fn get(&self, id: &OperatorId) -> Option<Arc<OperatorEntry>> {
        let arena = self.arena.read();
        let index = arena.by_id.get(id)?;
        arena.slots.get(index.0).and_then(|slot| slot.clone())
    }

    pub fn contains(&self, id: &OperatorId) -> bool {
        self.arena.read().by_id.contains_key(id)
    }

    /// Definitions ordered by priority, then id
    pub fn list(&self) -> Vec<OperatorRecord> {
        let mut records: Vec<OperatorRecord> = self
            .arena
            .read()
            .slots
            .iter()
            .flatten()
            .map(|entry| entry.record())
            .collect();
        records.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.arena.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages per second the operator's bucket refills at
    pub fn effective_tps(&self, entry: &OperatorEntry) -> u32 {
        match entry.max_tps() {
            0 => self.default_tps,
            tps => tps,
        }
    }

    /// (in-flight + queued) / effective TPS
    pub fn load_of(&self, entry: &OperatorEntry) -> f64 {
        let pending = (entry.in_flight() + entry.queued()) as f64;
        match self.effective_tps(entry) {
            0 if pending > 0.0 => f64::INFINITY,
            0 => 0.0,
            tps => pending / tps as f64,
        }
    }

    pub fn load(&self, id: &OperatorId) -> Option<f64> {
        self.get(id).map(|entry| self.load_of(&entry))
    }

    /// Active and below capacity. An operator at load 1.0 is full.
    pub fn is_eligible(&self, id: &OperatorId) -> bool {
        self.get(id).is_some_and(|entry| {
            entry.status() == OperatorStatus::Active && self.load_of(&entry) < 1.0
        })
    }

    pub fn loads(&self) -> Vec<OperatorLoad> {
        let entries: Vec<Arc<OperatorEntry>> =
            self.arena.read().slots.iter().flatten().cloned().collect();
        let mut loads: Vec<OperatorLoad> = entries
            .iter()
            .map(|entry| {
                let record = entry.record();
                OperatorLoad {
                    id: record.id,
                    name: record.name,
                    status: record.status,
                    max_tps: self.effective_tps(entry),
                    queued: entry.queued(),
                    in_flight: entry.in_flight(),
                    load: self.load_of(entry),
                }
            })
            .collect();
        loads.sort_by(|a, b| a.id.cmp(&b.id));
        loads
    }
}
