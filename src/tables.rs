//! Connection groups and the process table (design component C5).
//!
//! The design notes call for replacing the original's intrusive
//! doubly-linked lists and pointer back-links with an id-arena: entities
//! live in a slab, links are indices, and a stamp on each slot detects
//! use-after-recycle. `libinetd/connprocs.cpp`'s 256-bucket hashed
//! `conninfo`/`procinfo` tables are the structural model; the arena
//! replaces its manual pointer graph per the design notes' "Source
//! patterns requiring re-architecture" guidance.

use std::collections::HashMap;
use std::net::IpAddr;

/// A slab slot index paired with a generation stamp. A stale handle
/// (referring to a recycled slot) is detected by stamp mismatch rather
/// than dereferencing freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    stamp: u32,
}

struct Slot<T> {
    value: Option<T>,
    stamp: u32,
}

/// A generic slab arena: handles are indices, no handle ever dereferences
/// past a recycle because the stamp changes on every reuse.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena { slots: Vec::new(), free: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            Handle { index, stamp: slot.stamp }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { value: Some(value), stamp: 0 });
            Handle { index, stamp: 0 }
        }
    }

    pub fn get(&self, h: Handle) -> Option<&T> {
        self.slots.get(h.index as usize).and_then(|s| {
            if s.stamp == h.stamp { s.value.as_ref() } else { None }
        })
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        self.slots.get_mut(h.index as usize).and_then(|s| {
            if s.stamp == h.stamp { s.value.as_mut() } else { None }
        })
    }

    pub fn remove(&mut self, h: Handle) -> Option<T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.stamp != h.stamp {
            return None;
        }
        let value = slot.value.take();
        slot.stamp = slot.stamp.wrapping_add(1);
        self.free.push(h.index);
        value
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.value.as_ref())
    }
}

/// A child process spawned by the dispatcher.
#[derive(Debug, Clone)]
pub struct ProcRecord {
    pub pid: i32,
    pub service: String,
    pub group: Option<IpAddr>,
}

/// Per-`(service, remote-address)` set of live workers, used to enforce
/// `per_source` caps. `capacity == 0` means the per-source feature is
/// disabled for this service (no groups are created; see `newproc`).
pub struct ConnGroup {
    pub remote: IpAddr,
    pub capacity: usize,
    procs: Vec<Handle>,
}

impl ConnGroup {
    pub fn new(remote: IpAddr, capacity: usize) -> Self {
        ConnGroup { remote, capacity, procs: Vec::new() }
    }

    pub fn occupancy(&self) -> usize {
        self.procs.len()
    }

    /// Reserve a slot for a new proc. Returns `None` when the feature is
    /// disabled (`capacity == 0`); `Some(Err(()))` on overflow;
    /// `Some(Ok(()))` on success.
    pub fn newproc(&mut self, proc: Handle) -> Option<Result<(), ()>> {
        if self.capacity == 0 {
            return None;
        }
        if self.procs.len() >= self.capacity {
            return Some(Err(()));
        }
        self.procs.push(proc);
        Some(Ok(()))
    }

    /// O(1) removal: swap the removed entry with the last.
    pub fn remove(&mut self, proc: Handle) {
        if let Some(pos) = self.procs.iter().position(|p| *p == proc) {
            self.procs.swap_remove(pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

/// Per-service bookkeeping: the arena of live procs, their owning
/// connection groups keyed by remote address (replacing the original's
/// 256-bucket hash with a `HashMap`, which gives the same lookup
/// semantics without a hand-rolled hash/bucket chain), and the global
/// child list.
#[derive(Default)]
pub struct ServiceTables {
    procs: Arena<ProcRecord>,
    groups: HashMap<IpAddr, ConnGroup>,
    child_list: Vec<Handle>,
}

impl ServiceTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_count(&self) -> usize {
        self.child_list.len()
    }

    /// Admit a new child from `remote`, respecting `per_source`. Returns
    /// the new proc handle on success.
    pub fn admit(
        &mut self,
        service: &str,
        remote: IpAddr,
        pid: i32,
        per_source_cap: usize,
    ) -> Result<Handle, AdmitError> {
        let group_full;
        if per_source_cap > 0 {
            let group = self
                .groups
                .entry(remote)
                .or_insert_with(|| ConnGroup::new(remote, per_source_cap));
            group_full = group.occupancy() >= group.capacity;
        } else {
            group_full = false;
        }
        if group_full {
            return Err(AdmitError::PerSourceFull);
        }

        let handle = self.procs.insert(ProcRecord {
            pid,
            service: service.to_string(),
            group: if per_source_cap > 0 { Some(remote) } else { None },
        });

        if per_source_cap > 0 {
            let group = self.groups.get_mut(&remote).expect("just inserted above");
            group.newproc(handle).expect("capacity > 0 checked above").expect("checked above");
        }
        self.child_list.push(handle);
        Ok(handle)
    }

    /// Reaper-side removal: drop the proc from the child list and its
    /// connection group (freeing the group if it becomes empty).
    pub fn retire(&mut self, handle: Handle) -> Option<ProcRecord> {
        if let Some(pos) = self.child_list.iter().position(|h| *h == handle) {
            self.child_list.swap_remove(pos);
        }
        let record = self.procs.remove(handle)?;
        if let Some(remote) = record.group {
            if let Some(group) = self.groups.get_mut(&remote) {
                group.remove(handle);
                if group.is_empty() {
                    self.groups.remove(&remote);
                }
            }
        }
        Some(record)
    }

    pub fn proc(&self, handle: Handle) -> Option<&ProcRecord> {
        self.procs.get(handle)
    }

    pub fn children(&self) -> impl Iterator<Item = &ProcRecord> {
        self.child_list.iter().filter_map(|h| self.procs.get(*h))
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<Handle> {
        self.child_list
            .iter()
            .copied()
            .find(|h| self.procs.get(*h).is_some_and(|p| p.pid == pid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    PerSourceFull,
}
