//! # Reference Table
//!
//! Per-session bookkeeping of every remote object the session currently holds.
//!
//! ## Invariants
//! - **Single Owner**: a table belongs to exactly one session; refs of other
//!   sessions are never inserted.
//! - **Location Aware**: each entry remembers the worker that holds the object,
//!   so a call routed elsewhere is caught before it is sent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use refwire::Ref;
use refwire::RefId;

use crate::pool::WorkerId;

/// Why a ref can no longer be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// The ref was released, explicitly or with its session.
    Released,
    /// The call was routed to a worker that does not hold the object.
    WorkerMismatch { bound: WorkerId, routed: WorkerId },
    /// The worker holding the object crashed.
    WorkerLost(WorkerId),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "it was released"),
            Self::WorkerMismatch { bound, routed } => {
                write!(f, "it lives on {} but the call was routed to {}", bound, routed)
            }
            Self::WorkerLost(worker) => write!(f, "{} crashed", worker),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefEntry {
    pub handle: Ref,
    pub worker: WorkerId,
    /// Set when the holding worker crashed.
    pub lost: bool,
}

#[derive(Debug, Default)]
pub struct ReferenceTable {
    entries: HashMap<RefId, RefEntry>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `handle` as living on `worker`. Returns false if it was already known.
    ///
    /// A worker may hand back the same object twice; the latest location wins.
    pub fn insert(&mut self, handle: Ref, worker: WorkerId) -> bool {
        let id = handle.id.clone();
        self.entries
            .insert(id, RefEntry { handle, worker, lost: false })
            .is_none()
    }

    pub fn get(&self, id: &RefId) -> Option<&RefEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RefId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &RefId) -> Option<RefEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that `id` can be sent to `routed`.
    ///
    /// With `worker_independent` set, objects are assumed reachable from every
    /// worker and only releases and crashes make a ref stale.
    pub fn check(&self, id: &RefId, routed: WorkerId, worker_independent: bool) -> Result<(), StaleReason> {
        let Some(entry) = self.entries.get(id) else {
            return Err(StaleReason::Released);
        };
        if entry.lost {
            return Err(StaleReason::WorkerLost(entry.worker));
        }
        if !worker_independent && entry.worker != routed {
            return Err(StaleReason::WorkerMismatch { bound: entry.worker, routed });
        }
        Ok(())
    }

    /// Marks every object held by `worker` as lost. Returns how many were affected.
    pub fn mark_lost(&mut self, worker: WorkerId) -> usize {
        let mut count = 0;
        for entry in self.entries.values_mut().filter(|e| e.worker == worker && !e.lost) {
            entry.lost = true;
            count += 1;
        }
        count
    }

    /// Empties the table, grouping the released refs by the worker holding them.
    ///
    /// Objects on crashed workers are dropped here; there is nobody left to tell.
    pub fn drain_by_worker(&mut self) -> BTreeMap<WorkerId, Vec<Ref>> {
        let mut grouped: BTreeMap<WorkerId, Vec<Ref>> = BTreeMap::new();
        for (_, entry) in self.entries.drain() {
            if entry.lost {
                continue;
            }
            grouped.entry(entry.worker).or_default().push(entry.handle);
        }
        grouped
    }
}
