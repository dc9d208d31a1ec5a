//
// bucket.rs -- hash bucket routines
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Error, ErrorKind, Read};

use crate::avail::{self, AvailElem, AVAIL_ELEM_SZ};
use crate::hash::{hash_key, PartialKey, HASH_BITS, KEY_SMALL};
use crate::ser::{read_u32, read_u64, write_u32, write_u64};

/// Capacity of the per-bucket avail array.
pub const BUCKET_AVAIL: usize = 6;

/// Slot hash value marking an empty slot. The key hash is 31 bits wide and
/// can never produce it.
pub const EMPTY_HASH: u32 = u32::MAX;

/// On-disk size of one bucket slot:
/// `{hash u32, key_start [u8; 4], data_ofs u64, key_size u32, data_size u32}`.
pub const BUCKET_ELEM_SZ: u32 = 24;

/// On-disk size of the bucket header: avail count + padding, the avail
/// array, local depth and live-slot count.
pub const BUCKET_HDR_SZ: u32 = 8 + BUCKET_AVAIL as u32 * AVAIL_ELEM_SZ + 8;

#[derive(Debug, Clone, Copy)]
pub struct BucketElement {
    pub hash: u32,
    pub key_start: PartialKey,
    pub data_ofs: u64,
    pub key_size: u32,
    pub data_size: u32,
}

impl BucketElement {
    pub fn new(key: &[u8], data: &[u8], data_ofs: u64) -> BucketElement {
        BucketElement {
            hash: hash_key(key),
            key_start: PartialKey::new(key),
            data_ofs,
            key_size: key.len() as u32,
            data_size: data.len() as u32,
        }
    }

    pub fn empty() -> BucketElement {
        BucketElement {
            hash: EMPTY_HASH,
            key_start: PartialKey::default(),
            data_ofs: 0,
            key_size: 0,
            data_size: 0,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.hash != EMPTY_HASH
    }

    pub fn from_reader(rdr: &mut impl Read) -> io::Result<Self> {
        let hash = read_u32(rdr)?;

        let mut key_start = [0u8; KEY_SMALL];
        rdr.read_exact(&mut key_start)?;

        let data_ofs = read_u64(rdr)?;
        let key_size = read_u32(rdr)?;
        let data_size = read_u32(rdr)?;

        Ok(BucketElement {
            hash,
            key_start: PartialKey(key_start),
            data_ofs,
            key_size,
            data_size,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.hash);
        buf.extend_from_slice(&self.key_start.0);
        write_u64(buf, self.data_ofs);
        write_u32(buf, self.key_size);
        write_u32(buf, self.data_size);
    }
}

/// In-memory image of one on-disk hash bucket.
///
/// Collisions are resolved by linear probing within the slot table: a key
/// with hash `h` lives at the first free slot at or cyclically after
/// `h % bucket_elems`, and a lookup stops at the first empty slot.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub avail: Vec<AvailElem>,
    /// Local depth: the number of hash prefix bits this bucket is
    /// responsible for. Always <= the directory bits.
    pub bits: u32,
    pub count: u32,
    pub tab: Vec<BucketElement>,
}

impl Bucket {
    pub fn new(bits: u32, elems: usize) -> Bucket {
        Bucket {
            avail: Vec::new(),
            bits,
            count: 0,
            tab: vec![BucketElement::empty(); elems],
        }
    }

    pub fn from_reader(bucket_elems: u32, rdr: &mut impl Read) -> io::Result<Self> {
        let av_count = read_u32(rdr)? as usize;
        let _padding = read_u32(rdr)?;

        if av_count > BUCKET_AVAIL {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "bucket avail count out of range",
            ));
        }

        let mut avail = Vec::with_capacity(av_count);
        for _ in 0..av_count {
            avail.push(AvailElem::from_reader(rdr)?);
        }

        // skip the unused remainder of the avail array
        for _ in av_count..BUCKET_AVAIL {
            let _ = AvailElem::from_reader(rdr)?;
        }

        // historical writers can leave the array unsorted; repair in memory
        if !avail::is_sorted(&avail) {
            avail.sort();
        }

        let bits = read_u32(rdr)?;
        let count = read_u32(rdr)?;

        let tab = (0..bucket_elems)
            .map(|_| BucketElement::from_reader(rdr))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Bucket {
            avail,
            bits,
            count,
            tab,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.avail.len() as u32);
        write_u32(buf, 0);

        for elem in &self.avail {
            elem.serialize(buf);
        }
        let empty = AvailElem { sz: 0, addr: 0 };
        for _ in self.avail.len()..BUCKET_AVAIL {
            empty.serialize(buf);
        }

        write_u32(buf, self.bits);
        write_u32(buf, self.count);

        for elem in &self.tab {
            elem.serialize(buf);
        }
    }

    /// Number of slots whose hash is not the empty sentinel.
    pub fn live_slots(&self) -> u32 {
        self.tab.iter().filter(|elem| elem.is_occupied()).count() as u32
    }

    /// Inserts an element by linear probe. The caller guarantees at least
    /// one free slot.
    pub fn insert(&mut self, elem: BucketElement) {
        let len = self.tab.len();
        let mut slot = elem.hash as usize % len;

        while self.tab[slot].is_occupied() {
            slot = (slot + 1) % len;
        }

        self.tab[slot] = elem;
        self.count += 1;
    }

    /// Removes the element at `index` and compacts the probe chain so
    /// every remaining element is still reachable from its home slot
    /// without crossing an empty slot.
    pub fn remove(&mut self, index: usize) -> BucketElement {
        let len = self.tab.len();
        let removed = std::mem::replace(&mut self.tab[index], BucketElement::empty());
        self.count -= 1;

        let mut gap = index;
        let mut probe = index;
        loop {
            probe = (probe + 1) % len;
            if !self.tab[probe].is_occupied() {
                break;
            }

            let home = self.tab[probe].hash as usize % len;
            // an element whose home lies cyclically in (gap, probe] is
            // still reachable; anything else must move back into the gap
            let reachable = if gap < probe {
                home > gap && home <= probe
            } else {
                home > gap || home <= probe
            };
            if !reachable {
                self.tab.swap(gap, probe);
                gap = probe;
            }
        }

        removed
    }

    /// Redistributes this (full) bucket into two children one bit deeper.
    /// The first child inherits this bucket's avail array; the caller
    /// seeds the second child's avail pool.
    pub fn split(&self) -> (Bucket, Bucket) {
        let new_bits = self.bits + 1;
        let mut bucket0 = Bucket::new(new_bits, self.tab.len());
        let mut bucket1 = Bucket::new(new_bits, self.tab.len());

        for elem in self.tab.iter().filter(|elem| elem.is_occupied()) {
            if (elem.hash >> (HASH_BITS - new_bits)) & 1 == 0 {
                bucket0.insert(*elem);
            } else {
                bucket1.insert(*elem);
            }
        }

        bucket0.avail = self.avail.clone();

        (bucket0, bucket1)
    }

    /// Best-fit allocation from the per-bucket avail pool.
    pub fn allocate(&mut self, size: u32) -> Option<AvailElem> {
        avail::remove_best_fit(&mut self.avail, size)
    }

    /// Returns a region to the per-bucket pool. When the pool would
    /// overflow, the smallest element is spilled back to the caller for
    /// placement in the master pool.
    pub fn free(&mut self, addr: u64, sz: u32, coalesce: bool) -> Option<AvailElem> {
        avail::insert_elem(&mut self.avail, addr, sz, coalesce);

        if self.avail.len() > BUCKET_AVAIL {
            Some(self.avail.remove(0))
        } else {
            None
        }
    }
}
