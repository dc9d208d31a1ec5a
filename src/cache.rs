//
// cache.rs -- in-memory bucket cache
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Bounded cache of in-memory buckets keyed by file offset.
//!
//! Entries live in an arena and carry integer links: `prev`/`next` maintain
//! a most-recently-used list, `coll` chains collisions in a power-of-two
//! hash table of arena indices. The entry at the MRU head is the "current"
//! bucket.
//!
//! Dirty entries always form a contiguous prefix of the MRU list. The
//! handle enforces this by flushing the prefix before a clean entry is
//! promoted to (or inserted at) the head; the two dirty buckets created by
//! a split are linked immediately behind the head to keep the prefix
//! contiguous. Sync therefore flushes in O(dirty prefix).

use crate::bucket::Bucket;

/// Bucket-cache capacity policy.
///
/// `Entries(0)` is the auto sentinel, equivalent to `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSize {
    /// Start small and double when full, up to one entry per directory
    /// entry.
    #[default]
    Auto,
    /// Fixed capacity; the least-recently-used entry is evicted when full.
    Entries(usize),
}

// capacity floor: a split needs the splitting bucket and both children
// resident at once, with room to spare
const MIN_CAPACITY: usize = 8;
const AUTO_START_CAPACITY: usize = 32;

#[derive(Debug)]
struct CacheEntry {
    adr: u64,
    bucket: Bucket,
    dirty: bool,
    /// Neighbour toward the MRU head.
    prev: Option<usize>,
    /// Neighbour toward the LRU tail.
    next: Option<usize>,
    /// Hash-table collision chain.
    coll: Option<usize>,
}

#[derive(Debug)]
pub struct BucketCache {
    entries: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    table: Vec<Option<usize>>,
    mru: Option<usize>,
    lru: Option<usize>,
    len: usize,
    capacity: usize,
    auto: bool,
    auto_ceiling: usize,
    dirty_count: usize,
}

impl BucketCache {
    pub fn new(size: CacheSize, dir_bits: u32) -> BucketCache {
        let (auto, capacity) = match size {
            CacheSize::Auto | CacheSize::Entries(0) => {
                (true, AUTO_START_CAPACITY.max(MIN_CAPACITY))
            }
            CacheSize::Entries(n) => (false, n.max(MIN_CAPACITY)),
        };

        let mut cache = BucketCache {
            entries: Vec::new(),
            free: Vec::new(),
            table: Vec::new(),
            mru: None,
            lru: None,
            len: 0,
            capacity,
            auto,
            auto_ceiling: 0,
            dirty_count: 0,
        };
        cache.set_auto_ceiling(dir_bits);
        cache.rebuild_table();

        cache
    }

    /// Raises the auto-mode growth ceiling to one entry per directory
    /// entry. Called after every directory doubling.
    pub fn set_auto_ceiling(&mut self, dir_bits: u32) {
        self.auto_ceiling = (1usize << dir_bits.min(24)).max(AUTO_START_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty_count != 0
    }

    /// Drops every entry, keeping the capacity policy. Used when the
    /// handle is rebound to a fresh file.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.free.clear();
        self.mru = None;
        self.lru = None;
        self.len = 0;
        self.dirty_count = 0;
        self.rebuild_table();
    }

    fn table_slot(&self, adr: u64) -> usize {
        fxhash::hash64(&adr) as usize & (self.table.len() - 1)
    }

    fn rebuild_table(&mut self) {
        let size = (self.capacity * 2).next_power_of_two();
        self.table = vec![None; size];

        // repopulate collision chains from the MRU list
        let mut cur = self.mru;
        while let Some(idx) = cur {
            let adr = self.entry(idx).adr;
            let slot = self.table_slot(adr);
            let head = self.table[slot];
            self.entry_mut(idx).coll = head;
            self.table[slot] = Some(idx);
            cur = self.entry(idx).next;
        }
    }

    fn entry(&self, idx: usize) -> &CacheEntry {
        self.entries[idx].as_ref().unwrap()
    }

    fn entry_mut(&mut self, idx: usize) -> &mut CacheEntry {
        self.entries[idx].as_mut().unwrap()
    }

    pub fn index_of(&self, adr: u64) -> Option<usize> {
        let mut cur = self.table[self.table_slot(adr)];
        while let Some(idx) = cur {
            if self.entry(idx).adr == adr {
                return Some(idx);
            }
            cur = self.entry(idx).coll;
        }

        None
    }

    pub fn contains(&self, adr: u64) -> bool {
        self.index_of(adr).is_some()
    }

    pub fn mru_index(&self) -> Option<usize> {
        self.mru
    }

    pub fn is_dirty(&self, idx: usize) -> bool {
        self.entry(idx).dirty
    }

    pub fn adr_at(&self, idx: usize) -> u64 {
        self.entry(idx).adr
    }

    pub fn bucket_at(&self, idx: usize) -> &Bucket {
        &self.entry(idx).bucket
    }

    /// Offset of the current (most recently used) bucket.
    pub fn current_offset(&self) -> Option<u64> {
        self.mru.map(|idx| self.entry(idx).adr)
    }

    pub fn current_bucket(&self) -> Option<&Bucket> {
        self.mru.map(|idx| &self.entry(idx).bucket)
    }

    /// Mutable access to the current bucket. Marks it dirty: mutation and
    /// write-back obligation are the same thing here.
    pub fn current_bucket_mut(&mut self) -> Option<&mut Bucket> {
        let idx = self.mru?;
        let entry = self.entries[idx].as_mut().unwrap();
        if !entry.dirty {
            entry.dirty = true;
            self.dirty_count += 1;
        }

        Some(&mut entry.bucket)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.entry(idx);
            (entry.prev, entry.next)
        };

        match prev {
            Some(p) => self.entry_mut(p).next = next,
            None => self.mru = next,
        }
        match next {
            Some(n) => self.entry_mut(n).prev = prev,
            None => self.lru = prev,
        }

        let entry = self.entry_mut(idx);
        entry.prev = None;
        entry.next = None;
    }

    fn link_head(&mut self, idx: usize) {
        let old_head = self.mru;
        {
            let entry = self.entry_mut(idx);
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_mut(h).prev = Some(idx),
            None => self.lru = Some(idx),
        }
        self.mru = Some(idx);
    }

    fn link_after(&mut self, idx: usize, after: usize) {
        let next = self.entry(after).next;
        self.entry_mut(after).next = Some(idx);
        {
            let entry = self.entry_mut(idx);
            entry.prev = Some(after);
            entry.next = next;
        }
        match next {
            Some(n) => self.entry_mut(n).prev = Some(idx),
            None => self.lru = Some(idx),
        }
    }

    fn table_insert(&mut self, idx: usize) {
        let slot = self.table_slot(self.entry(idx).adr);
        let head = self.table[slot];
        self.entry_mut(idx).coll = head;
        self.table[slot] = Some(idx);
    }

    fn table_remove(&mut self, idx: usize) {
        let slot = self.table_slot(self.entry(idx).adr);
        let target_coll = self.entry(idx).coll;

        if self.table[slot] == Some(idx) {
            self.table[slot] = target_coll;
            return;
        }

        let mut cur = self.table[slot];
        while let Some(c) = cur {
            let next = self.entry(c).coll;
            if next == Some(idx) {
                self.entry_mut(c).coll = target_coll;
                return;
            }
            cur = next;
        }
    }

    fn remove_index(&mut self, idx: usize) -> (u64, Bucket, bool) {
        self.table_remove(idx);
        self.unlink(idx);

        let entry = self.entries[idx].take().unwrap();
        self.free.push(idx);
        self.len -= 1;
        if entry.dirty {
            self.dirty_count -= 1;
        }

        (entry.adr, entry.bucket, entry.dirty)
    }

    /// Drops the entry for `adr` without writing it. Used for the bucket
    /// retired by a split.
    pub fn remove(&mut self, adr: u64) -> Option<(Bucket, bool)> {
        self.index_of(adr)
            .map(|idx| self.remove_index(idx))
            .map(|(_, bucket, dirty)| (bucket, dirty))
    }

    /// Moves an existing entry to the MRU head. The caller has already
    /// honored the dirty-prefix discipline.
    pub fn promote(&mut self, adr: u64) {
        if let Some(idx) = self.index_of(adr) {
            if self.mru != Some(idx) {
                self.unlink(idx);
                self.link_head(idx);
            }
        }
    }

    // Makes room for one more entry. Growth in auto mode, otherwise LRU
    // eviction; a dirty eviction victim is handed back for write-back.
    fn make_room(&mut self) -> Option<(u64, Bucket, bool)> {
        if self.len < self.capacity {
            return None;
        }

        if self.auto && self.capacity < self.auto_ceiling {
            self.capacity = (self.capacity * 2).min(self.auto_ceiling);
            self.rebuild_table();
            return None;
        }

        let victim = self.lru.expect("cache full implies nonempty");
        Some(self.remove_index(victim))
    }

    fn alloc_entry(&mut self, entry: CacheEntry) -> usize {
        self.len += 1;
        if entry.dirty {
            self.dirty_count += 1;
        }

        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    /// Inserts a bucket at the MRU head. Returns an evicted
    /// `(offset, bucket, dirty)` that the caller must write back if dirty.
    pub fn insert_mru(
        &mut self,
        adr: u64,
        bucket: Bucket,
        dirty: bool,
    ) -> Option<(u64, Bucket, bool)> {
        debug_assert!(!self.contains(adr));
        let evicted = self.make_room();

        let idx = self.alloc_entry(CacheEntry {
            adr,
            bucket,
            dirty,
            prev: None,
            next: None,
            coll: None,
        });
        self.table_insert(idx);
        self.link_head(idx);

        evicted
    }

    /// Inserts a (dirty) bucket immediately behind the MRU head, keeping
    /// the dirty prefix contiguous during a split.
    pub fn insert_after_mru(&mut self, adr: u64, bucket: Bucket) -> Option<(u64, Bucket, bool)> {
        debug_assert!(!self.contains(adr));
        let evicted = self.make_room();

        let idx = self.alloc_entry(CacheEntry {
            adr,
            bucket,
            dirty: true,
            prev: None,
            next: None,
            coll: None,
        });
        self.table_insert(idx);
        match self.mru {
            Some(head) => self.link_after(idx, head),
            None => self.link_head(idx),
        }

        evicted
    }

    /// Arena indices of the dirty prefix, in MRU order.
    pub fn dirty_indices(&self) -> Vec<(u64, usize)> {
        let mut out = Vec::with_capacity(self.dirty_count);
        let mut cur = self.mru;
        while let Some(idx) = cur {
            let entry = self.entry(idx);
            if !entry.dirty {
                break;
            }
            out.push((entry.adr, idx));
            cur = entry.next;
        }

        out
    }

    pub fn clear_dirty(&mut self) {
        let mut cur = self.mru;
        while let Some(idx) = cur {
            let entry = self.entry_mut(idx);
            if !entry.dirty {
                break;
            }
            entry.dirty = false;
            cur = entry.next;
        }
        self.dirty_count = 0;
    }

    /// Invariant check: dirty entries form a contiguous prefix of the MRU
    /// list.
    pub fn dirty_is_prefix(&self) -> bool {
        let mut seen_clean = false;
        let mut count = 0;
        let mut cur = self.mru;
        while let Some(idx) = cur {
            let entry = self.entry(idx);
            if entry.dirty {
                if seen_clean {
                    return false;
                }
                count += 1;
            } else {
                seen_clean = true;
            }
            cur = entry.next;
        }

        count == self.dirty_count
    }
}
