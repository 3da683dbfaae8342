//! C5: the per-process mapping registry.
//!
//! A flat, insertion-ordered list of `(mapid, addr)` pairs plus the
//! `next_mapid` counter `mmap` draws from. Entries are grouped by `mapid`
//! and `mapid`s are non-decreasing in insertion order — `mmap` only ever
//! appends, and `munmap`/rollback only ever remove from the back or by
//! exact `mapid` match, so the invariant is never disturbed once
//! established.
//!
//! This module owns none of the `Page` state itself; it is a thin ledger
//! of which addresses belong to which mapping, so
//! [`supplemental_page_table`](crate::supplemental_page_table) can ask "what
//! addresses make up mapping `m`" without scanning its own `BTreeMap` for a
//! linear `mapid` field.

use alloc::{collections::VecDeque, vec::Vec};
use keos::addressing::Va;

struct Record {
    mapid: usize,
    addr: Va,
}

/// The ordered mapping list and `next_mapid` counter for one process.
#[derive(Default)]
pub struct MappingRegistry {
    next_mapid: usize,
    records: VecDeque<Record>,
}

impl MappingRegistry {
    /// Creates an empty registry with `next_mapid` starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the next `mapid`, advancing the counter. The caller must
    /// either [`push`](Self::push) every page of the mapping under this id
    /// or [`rollback`](Self::rollback) it before drawing another.
    pub fn reserve_mapid(&mut self) -> usize {
        let id = self.next_mapid;
        self.next_mapid += 1;
        id
    }

    /// Appends `addr` to the mapping named `mapid`. Callers must push pages
    /// of one mapping in address order, and must not interleave pushes for
    /// two different mapids.
    pub fn push(&mut self, mapid: usize, addr: Va) {
        self.records.push_back(Record { mapid, addr });
    }

    /// Undoes every push made for `mapid` so far and returns `next_mapid` to
    /// `mapid`, for when a mapping fails partway through construction.
    ///
    /// Only valid to call with the most recently reserved, not-yet-completed
    /// `mapid` — this pops from the back, relying on the invariant that a
    /// mapping under construction is always the newest thing in the list.
    pub fn rollback(&mut self, mapid: usize) -> Vec<Va> {
        debug_assert_eq!(
            self.next_mapid,
            mapid + 1,
            "rollback must target the most recently reserved mapid"
        );
        let mut addrs = Vec::new();
        while matches!(self.records.back(), Some(r) if r.mapid == mapid) {
            addrs.push(self.records.pop_back().unwrap().addr);
        }
        self.next_mapid = mapid;
        addrs
    }

    /// Removes every entry belonging to `mapid` and returns their
    /// addresses, in the order they were pushed. Returns an empty list if
    /// `mapid` is unknown — `munmap` of an already-unmapped or never-mapped
    /// id is a no-op, matching idempotent-`munmap` semantics.
    pub fn take_mapping(&mut self, mapid: usize) -> Vec<Va> {
        let mut matched = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.records.len());
        for rec in self.records.drain(..) {
            if rec.mapid == mapid {
                matched.push(rec.addr);
            } else {
                remaining.push_back(rec);
            }
        }
        self.records = remaining;
        matched
    }

    /// The next `mapid` that would be drawn. Exposed for tests.
    pub fn peek_next_mapid(&self) -> usize {
        self.next_mapid
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn mapids_are_non_decreasing_across_mappings() {
        let mut reg = MappingRegistry::new();
        let m0 = reg.reserve_mapid();
        reg.push(m0, va(0x1000));
        reg.push(m0, va(0x2000));
        let m1 = reg.reserve_mapid();
        reg.push(m1, va(0x3000));
        assert_eq!(m0, 0);
        assert_eq!(m1, 1);
        assert_eq!(reg.peek_next_mapid(), 2);
    }

    #[test]
    fn take_mapping_returns_pushed_addresses_in_order() {
        let mut reg = MappingRegistry::new();
        let m = reg.reserve_mapid();
        reg.push(m, va(0x1000));
        reg.push(m, va(0x2000));
        let addrs = reg.take_mapping(m);
        assert_eq!(addrs, alloc::vec![va(0x1000), va(0x2000)]);
    }

    #[test]
    fn second_munmap_of_same_mapid_is_a_no_op() {
        let mut reg = MappingRegistry::new();
        let m = reg.reserve_mapid();
        reg.push(m, va(0x1000));
        assert_eq!(reg.take_mapping(m).len(), 1);
        assert!(reg.take_mapping(m).is_empty());
    }

    #[test]
    fn take_mapping_leaves_other_mapids_untouched() {
        let mut reg = MappingRegistry::new();
        let m0 = reg.reserve_mapid();
        reg.push(m0, va(0x1000));
        let m1 = reg.reserve_mapid();
        reg.push(m1, va(0x2000));
        reg.push(m1, va(0x3000));
        assert_eq!(reg.take_mapping(m0), alloc::vec![va(0x1000)]);
        assert_eq!(reg.take_mapping(m1), alloc::vec![va(0x2000), va(0x3000)]);
    }

    #[test]
    fn rollback_pops_from_the_back_and_restores_next_mapid() {
        let mut reg = MappingRegistry::new();
        let m0 = reg.reserve_mapid();
        reg.push(m0, va(0x1000));
        let m1 = reg.reserve_mapid();
        reg.push(m1, va(0x2000));
        reg.push(m1, va(0x3000));

        let rolled_back = reg.rollback(m1);
        assert_eq!(rolled_back, alloc::vec![va(0x3000), va(0x2000)]);
        assert_eq!(reg.peek_next_mapid(), 1);

        // m0's mapping is untouched and the counter can be reused cleanly.
        assert_eq!(reg.take_mapping(m0), alloc::vec![va(0x1000)]);
        let m1_again = reg.reserve_mapid();
        assert_eq!(m1_again, 1);
    }
}
