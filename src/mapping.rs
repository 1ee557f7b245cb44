//! Virtual page mapping table: prev physical page id -> current physical
//! page id, grounded in `vmtreeGetMappingIndex`/`vmtreeAddMapping`/
//! `vmtreeDeleteMapping`/`vmtreeGetMapping` in `vmtree.c`.

use crate::error::{Result, VmtreeError};

/// Sentinel marking an empty slot / "no mapping" value.
pub const EMPTY_MAPPING: u32 = u32::MAX;

const STRIDE: u32 = 7;

#[derive(Clone, Copy, Debug)]
struct Slot {
    prev: u32,
    curr: u32,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            prev: EMPTY_MAPPING,
            curr: EMPTY_MAPPING,
        }
    }

    fn is_empty(&self) -> bool {
        self.prev == EMPTY_MAPPING
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct MappingStats {
    pub count: usize,
    pub capacity: usize,
    pub num_mapping_compare: u64,
}

/// Fixed-capacity linear-probed hash table from previous physical page id to
/// current physical page id.
pub struct MappingTable {
    slots: Vec<Slot>,
    capacity: usize,
    max_tries: usize,
    count: usize,
    num_mapping_compare: u64,
    /// A pending (prev, curr) edge not yet committed via `upsert`, consulted
    /// by `resolve` during a `fixMappings` cascade (vmtree.c's
    /// `savedPrev`/`savedCurr`).
    saved: Option<(u32, u32)>,
}

impl MappingTable {
    /// `max_mappings` is the table capacity; `max_tries` bounds the probe
    /// chain length searched before giving up (spec default: 1).
    pub fn new(max_mappings: usize, max_tries: usize) -> Self {
        MappingTable {
            slots: vec![Slot::empty(); max_mappings.max(1)],
            capacity: max_mappings.max(1),
            max_tries: max_tries.max(1),
            count: 0,
            num_mapping_compare: 0,
            saved: None,
        }
    }

    fn home(&self, prev: u32) -> usize {
        (prev as usize) % self.capacity
    }

    /// Sets the pending edge consulted by `resolve` before the table probe,
    /// mirroring vmtree.c's use of `savedPrev`/`savedCurr` while a
    /// `fixMappings` cascade is in flight.
    pub fn set_saved(&mut self, prev: u32, curr: u32) {
        self.saved = Some((prev, curr));
    }

    pub fn clear_saved(&mut self) {
        self.saved = None;
    }

    /// Returns the mapped current page id for `p`, or `p` itself if absent.
    /// Never fails.
    pub fn resolve(&mut self, p: u32) -> u32 {
        if let Some((sp, sc)) = self.saved {
            if sp == p {
                return sc;
            }
        }
        let home = self.home(p);
        for i in 0..self.max_tries {
            let idx = (home + i * STRIDE as usize) % self.capacity;
            let slot = self.slots[idx];
            self.num_mapping_compare += 1;
            if slot.is_empty() {
                return p;
            }
            if slot.prev == p {
                return slot.curr;
            }
        }
        p
    }

    /// Updates an existing entry for `prev`, or inserts into the first
    /// empty probe slot. Fails with `OutOfMappingSpace` when every slot in
    /// the probe chain holds a different key.
    pub fn upsert(&mut self, prev: u32, curr: u32) -> Result<()> {
        let home = self.home(prev);
        let mut first_empty: Option<usize> = None;
        for i in 0..self.max_tries {
            let idx = (home + i * STRIDE as usize) % self.capacity;
            let slot = self.slots[idx];
            self.num_mapping_compare += 1;
            if slot.is_empty() {
                if first_empty.is_none() {
                    first_empty = Some(idx);
                }
                continue;
            }
            if slot.prev == prev {
                self.slots[idx].curr = curr;
                return Ok(());
            }
        }
        match first_empty {
            Some(idx) => {
                self.slots[idx] = Slot { prev, curr };
                self.count += 1;
                Ok(())
            }
            None => Err(VmtreeError::OutOfMappingSpace),
        }
    }

    /// Deletes the mapping for `prev`, if any.
    pub fn remove(&mut self, prev: u32) {
        let home = self.home(prev);
        for i in 0..self.max_tries {
            let idx = (home + i * STRIDE as usize) % self.capacity;
            let slot = self.slots[idx];
            self.num_mapping_compare += 1;
            if slot.is_empty() {
                return;
            }
            if slot.prev == prev {
                self.slots[idx] = Slot::empty();
                self.count -= 1;
                return;
            }
        }
    }

    /// All live (prev, curr) pairs, for debugging (`print_mappings`).
    pub fn scan(&self) -> Vec<(u32, u32)> {
        self.slots
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| (s.prev, s.curr))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> MappingStats {
        MappingStats {
            count: self.count,
            capacity: self.capacity,
            num_mapping_compare: self.num_mapping_compare,
        }
    }

    /// Resolves every stored mapping and drops those whose target is itself
    /// stable, shrinking the table. Used to drive testable property 4
    /// ("mapping closure") after a full tree `clear_mappings` walk has
    /// rewritten every stale pointer in place.
    pub fn retain_unresolved(&mut self) {
        for slot in self.slots.iter_mut() {
            if !slot.is_empty() && slot.prev == slot.curr {
                *slot = Slot::empty();
                self.count -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_missing_is_identity() {
        let mut t = MappingTable::new(8, 1);
        assert_eq!(t.resolve(42), 42);
    }

    #[test]
    fn upsert_then_resolve() {
        let mut t = MappingTable::new(8, 1);
        t.upsert(10, 20).unwrap();
        assert_eq!(t.resolve(10), 20);
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn upsert_updates_existing() {
        let mut t = MappingTable::new(8, 1);
        t.upsert(10, 20).unwrap();
        t.upsert(10, 30).unwrap();
        assert_eq!(t.resolve(10), 30);
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn remove_deletes_entry() {
        let mut t = MappingTable::new(8, 1);
        t.upsert(10, 20).unwrap();
        t.remove(10);
        assert_eq!(t.resolve(10), 10);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn saved_edge_takes_precedence() {
        let mut t = MappingTable::new(8, 1);
        t.set_saved(5, 99);
        assert_eq!(t.resolve(5), 99);
        t.clear_saved();
        assert_eq!(t.resolve(5), 5);
    }

    #[test]
    fn full_probe_chain_reports_out_of_space() {
        let mut t = MappingTable::new(4, 1);
        // All four home buckets collide with max_tries = 1: fill every slot.
        for i in 0..4u32 {
            t.upsert(i, i + 100).unwrap();
        }
        let err = t.upsert(4, 999);
        assert!(err.is_err());
    }
}
