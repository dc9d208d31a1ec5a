//
// avail.rs -- free-space pool routines
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Read};

use crate::ser::{read_u32, read_u64, write_u32, write_u64};
use crate::{Error, Result};

/// On-disk size of one avail element: `{sz u32, pad u32, addr u64}`.
pub const AVAIL_ELEM_SZ: u32 = 16;

/// On-disk size of an avail block header: `{sz u32, count u32, next_block u64}`.
pub const AVAIL_BLOCK_HDR_SZ: u32 = 16;

/// Descriptor of one free region inside the database file.
#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub struct AvailElem {
    pub sz: u32,
    pub addr: u64,
}

impl AvailElem {
    pub fn from_reader(rdr: &mut impl Read) -> io::Result<Self> {
        let sz = read_u32(rdr)?;
        let _padding = read_u32(rdr)?;
        let addr = read_u64(rdr)?;

        Ok(AvailElem { sz, addr })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.sz);
        write_u32(buf, 0);
        write_u64(buf, self.addr);
    }

    /// Bounds check against the file extents. `addr` must fall past the
    /// header block and the region must not run past the allocation
    /// watermark.
    pub fn validate(&self, block_size: u32, next_block: u64) -> Result<()> {
        let end = self
            .addr
            .checked_add(u64::from(self.sz))
            .ok_or(Error::BadAvail {
                offset: self.addr,
                size: self.sz,
            })?;

        if self.addr < u64::from(block_size) || end > next_block {
            return Err(Error::BadAvail {
                offset: self.addr,
                size: self.sz,
            });
        }

        Ok(())
    }
}

/// Pool operations shared by the master avail block and the small
/// per-bucket avail arrays. Both are kept sorted ascending by size.
pub fn is_sorted(elems: &[AvailElem]) -> bool {
    elems.windows(2).all(|w| w[0].sz <= w[1].sz)
}

/// Remove the smallest element that can hold `size` bytes.
pub fn remove_best_fit(elems: &mut Vec<AvailElem>, size: u32) -> Option<AvailElem> {
    elems
        .iter()
        .position(|elem| elem.sz >= size)
        .map(|idx| elems.remove(idx))
}

/// Return a free region to the pool, merging with adjacent regions when
/// `coalesce` is set. Insertion keeps the size-ascending sort.
pub fn insert_elem(elems: &mut Vec<AvailElem>, mut addr: u64, mut sz: u32, coalesce: bool) {
    if coalesce {
        while let Some(idx) = elems.iter().position(|elem| {
            elem.addr + u64::from(elem.sz) == addr || addr + u64::from(sz) == elem.addr
        }) {
            let merged = elems.remove(idx);
            addr = addr.min(merged.addr);
            sz += merged.sz;
        }
    }

    let pos = elems.partition_point(|elem| elem.sz < sz);
    elems.insert(pos, AvailElem { sz, addr });
}

/// A pool of free regions: the inline master block in the header, or one
/// overflow block chained from it through `next_block`.
#[derive(Debug, Clone)]
pub struct AvailBlock {
    /// Capacity in elements.
    pub sz: u32,
    /// File offset of the next overflow block, 0 if none.
    pub next_block: u64,
    pub elems: Vec<AvailElem>,
}

impl AvailBlock {
    pub fn new(sz: u32, next_block: u64, elems: Vec<AvailElem>) -> AvailBlock {
        AvailBlock {
            sz,
            next_block,
            elems,
        }
    }

    /// On-disk size of a block with capacity `sz`.
    pub fn extent_bytes(sz: u32) -> u32 {
        AVAIL_BLOCK_HDR_SZ + sz * AVAIL_ELEM_SZ
    }

    pub fn from_reader(rdr: &mut impl Read) -> io::Result<Self> {
        let sz = read_u32(rdr)?;
        let count = read_u32(rdr)?;
        let next_block = read_u64(rdr)?;

        if count > sz {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "avail block count exceeds capacity",
            ));
        }

        let elems = (0..count)
            .map(|_| AvailElem::from_reader(rdr))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(AvailBlock {
            sz,
            next_block,
            elems,
        })
    }

    /// Serializes the block at its full extent, zero-filling unused slots.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.sz);
        write_u32(buf, self.elems.len() as u32);
        write_u64(buf, self.next_block);

        for elem in &self.elems {
            elem.serialize(buf);
        }

        let empty = AvailElem { sz: 0, addr: 0 };
        for _ in self.elems.len()..self.sz as usize {
            empty.serialize(buf);
        }
    }

    pub fn is_full(&self) -> bool {
        self.elems.len() >= self.sz as usize
    }

    pub fn allocate(&mut self, size: u32) -> Option<AvailElem> {
        remove_best_fit(&mut self.elems, size)
    }

    pub fn free(&mut self, addr: u64, sz: u32, coalesce: bool) {
        insert_elem(&mut self.elems, addr, sz, coalesce);
    }

    /// Restores the size-ascending sort clobbered by historical writers.
    /// Returns true if the block was already sorted.
    pub fn ensure_sorted(&mut self) -> bool {
        if is_sorted(&self.elems) {
            true
        } else {
            self.elems.sort();
            false
        }
    }

    /// Splits the element list into two halves, alternating elements so
    /// both halves remain sorted. Used when the master block overflows
    /// into a new chained block.
    pub fn partition(&self) -> (Vec<AvailElem>, Vec<AvailElem>) {
        let mut keep = Vec::with_capacity(self.elems.len() / 2 + 1);
        let mut spill = Vec::with_capacity(self.elems.len() / 2);

        for (idx, elem) in self.elems.iter().enumerate() {
            if idx % 2 == 0 {
                keep.push(*elem);
            } else {
                spill.push(*elem);
            }
        }

        (keep, spill)
    }

    /// Merges a popped overflow block into this one, adopting its chain
    /// pointer. Elements that exceed this block's capacity are returned
    /// to the caller, largest first.
    pub fn absorb(&mut self, other: AvailBlock, coalesce: bool) -> Vec<AvailElem> {
        self.next_block = other.next_block;

        for elem in other.elems {
            insert_elem(&mut self.elems, elem.addr, elem.sz, coalesce);
        }

        let cap = self.sz as usize;
        if self.elems.len() > cap {
            self.elems.split_off(cap)
        } else {
            Vec::new()
        }
    }

    pub fn validate(&self, block_size: u32, next_block: u64) -> Result<()> {
        if self.elems.len() > self.sz as usize {
            return Err(Error::BadHeaderAvail {
                capacity: self.sz,
                count: self.elems.len() as u32,
            });
        }

        self.elems
            .iter()
            .try_for_each(|elem| elem.validate(block_size, next_block))
    }
}
