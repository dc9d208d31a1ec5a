//
// header.rs -- database file header routines
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Read};

use crate::avail::{AvailBlock, AVAIL_BLOCK_HDR_SZ, AVAIL_ELEM_SZ};
use crate::bucket::{BUCKET_ELEM_SZ, BUCKET_HDR_SZ};
use crate::dir::{build_dir_size, DIR_ENTRY_SZ, MAX_DIR_BITS, MIN_DIR_BITS};
use crate::magic::Magic;
use crate::ser::{read_u32, read_u64, write_u32, write_u64};
use crate::{Error, Result};

pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

// fixed header fields: magic, block_sz, dir_ofs, dir_sz, dir_bits,
// bucket_sz, bucket_elems, next_block
const HDR_FIXED_SZ: u32 = 4 + 4 + 8 + 4 + 4 + 4 + 4 + 8;

// extended format appends: version, numsync, two reserved words
const HDR_EXT_SZ: u32 = 4 * 4;

fn fixed_size(magic: Magic) -> u32 {
    match magic.is_numsync() {
        true => HDR_FIXED_SZ + HDR_EXT_SZ,
        false => HDR_FIXED_SZ,
    }
}

/// Element capacity of the inline master avail block: whatever fits in the
/// header block after the fixed fields and the avail block header.
pub fn avail_capacity(magic: Magic, block_sz: u32) -> u32 {
    (block_sz - fixed_size(magic) - AVAIL_BLOCK_HDR_SZ) / AVAIL_ELEM_SZ
}

/// The first block of the file: format identity, geometry, the allocation
/// watermark and the inline master avail block.
#[derive(Debug)]
pub struct Header {
    pub magic: Magic,
    pub block_sz: u32,
    pub dir_ofs: u64,
    pub dir_sz: u32,
    pub dir_bits: u32,
    pub bucket_sz: u32,
    pub bucket_elems: u32,
    /// Watermark: allocation beyond the current end of file starts here.
    pub next_block: u64,

    /// Extended format only.
    pub version: u32,
    /// Incremented by every successful sync of an extended database.
    pub numsync: u32,

    pub avail: AvailBlock,

    pub dirty: bool,
}

impl Header {
    /// Builds the header of a fresh database: header block, directory,
    /// and one initial bucket, allocated back to back.
    pub fn new(block_sz: u32, numsync: bool) -> Header {
        let magic = match numsync {
            true => Magic::Numsync,
            false => Magic::Standard,
        };
        let (dir_sz, dir_bits) = build_dir_size(block_sz);
        let bucket_elems = (block_sz - BUCKET_HDR_SZ) / BUCKET_ELEM_SZ;
        let bucket_sz = BUCKET_HDR_SZ + bucket_elems * BUCKET_ELEM_SZ;

        let dir_ofs = u64::from(block_sz);
        let next_block = dir_ofs + u64::from(dir_sz) + u64::from(block_sz);

        Header {
            magic,
            block_sz,
            dir_ofs,
            dir_sz,
            dir_bits,
            bucket_sz,
            bucket_elems,
            next_block,
            version: 0,
            numsync: 0,
            avail: AvailBlock::new(avail_capacity(magic, block_sz), 0, Vec::new()),
            dirty: true,
        }
    }

    /// File offset of the initial bucket created alongside this header.
    pub fn initial_bucket_ofs(&self) -> u64 {
        self.dir_ofs + u64::from(self.dir_sz)
    }

    pub fn from_reader(file_len: u64, rdr: &mut impl Read) -> Result<Header> {
        let magic = Magic::from_u32(read_u32(rdr).map_err(Error::Io)?)?;

        let block_sz = read_u32(rdr).map_err(Error::Io)?;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_sz) || !block_sz.is_power_of_two() {
            return Err(Error::BadHeaderBlockSize {
                size: block_sz,
                minimum: MIN_BLOCK_SIZE,
                maximum: MAX_BLOCK_SIZE,
            });
        }

        let dir_ofs = read_u64(rdr).map_err(Error::Io)?;
        let dir_sz = read_u32(rdr).map_err(Error::Io)?;
        let dir_bits = read_u32(rdr).map_err(Error::Io)?;
        let bucket_sz = read_u32(rdr).map_err(Error::Io)?;
        let bucket_elems = read_u32(rdr).map_err(Error::Io)?;
        let next_block = read_u64(rdr).map_err(Error::Io)?;

        let (version, numsync) = match magic.is_numsync() {
            true => {
                let version = read_u32(rdr).map_err(Error::Io)?;
                let numsync = read_u32(rdr).map_err(Error::Io)?;
                let _reserved0 = read_u32(rdr).map_err(Error::Io)?;
                let _reserved1 = read_u32(rdr).map_err(Error::Io)?;

                if version != 0 {
                    return Err(Error::BadHeaderVersion { version });
                }

                (version, numsync)
            }
            false => (0, 0),
        };

        if next_block > file_len {
            return Err(Error::BadHeaderNextBlock {
                next_block,
                file_size: file_len,
            });
        }

        if !(MIN_DIR_BITS..=MAX_DIR_BITS).contains(&dir_bits)
            || dir_sz != DIR_ENTRY_SZ << dir_bits
            || dir_ofs < u64::from(block_sz)
            || dir_ofs + u64::from(dir_sz) > next_block
        {
            return Err(Error::BadHeaderDirectory {
                offset: dir_ofs,
                size: dir_sz,
                bits: dir_bits,
            });
        }

        let expected_elems = (block_sz - BUCKET_HDR_SZ) / BUCKET_ELEM_SZ;
        if bucket_elems != expected_elems
            || bucket_sz != BUCKET_HDR_SZ + bucket_elems * BUCKET_ELEM_SZ
        {
            return Err(Error::BadHeaderBucket {
                size: bucket_sz,
                elems: bucket_elems,
                expected: expected_elems,
            });
        }

        let mut avail = AvailBlock::from_reader(rdr).map_err(Error::Io)?;
        if avail.sz != avail_capacity(magic, block_sz) {
            return Err(Error::BadHeaderAvail {
                capacity: avail.sz,
                count: avail.elems.len() as u32,
            });
        }

        // historical writers can clobber the sort; repair is in-memory and
        // reaches disk only through a writable handle's dirty path
        let repaired = !avail.ensure_sorted();
        if repaired {
            log::warn!("master avail block was unsorted; repaired");
        }
        avail.validate(block_sz, next_block)?;

        Ok(Header {
            magic,
            block_sz,
            dir_ofs,
            dir_sz,
            dir_bits,
            bucket_sz,
            bucket_elems,
            next_block,
            version,
            numsync,
            avail,
            dirty: repaired,
        })
    }

    /// Serializes the full header block, zero-padded to `block_sz`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.magic.as_u32());
        write_u32(buf, self.block_sz);
        write_u64(buf, self.dir_ofs);
        write_u32(buf, self.dir_sz);
        write_u32(buf, self.dir_bits);
        write_u32(buf, self.bucket_sz);
        write_u32(buf, self.bucket_elems);
        write_u64(buf, self.next_block);

        if self.magic.is_numsync() {
            write_u32(buf, self.version);
            write_u32(buf, self.numsync);
            write_u32(buf, 0);
            write_u32(buf, 0);
        }

        self.avail.serialize(buf);
        buf.resize(self.block_sz as usize, 0);
    }

    /// Best-fit allocation from the master avail pool.
    pub fn allocate(&mut self, size: u32) -> Option<(u64, u32)> {
        self.avail.allocate(size).map(|elem| {
            self.dirty = true;
            (elem.addr, elem.sz)
        })
    }

    /// Returns a region to the master avail pool.
    pub fn free(&mut self, addr: u64, sz: u32, coalesce: bool) {
        self.avail.free(addr, sz, coalesce);
        self.dirty = true;
    }

    pub fn increment_numsync(&mut self) {
        if self.magic.is_numsync() {
            self.numsync = self.numsync.wrapping_add(1);
            self.dirty = true;
        }
    }

    /// Converts between the standard and extended formats in place.
    ///
    /// Upgrading shrinks the master avail capacity; elements that no
    /// longer fit are returned as `(addr, size)` regions for the caller to
    /// re-home through the regular free path.
    pub fn convert_numsync(&mut self, numsync: bool) -> Vec<(u64, u32)> {
        if numsync == self.magic.is_numsync() {
            return Vec::new();
        }

        self.magic = match numsync {
            true => Magic::Numsync,
            false => Magic::Standard,
        };
        self.version = 0;
        self.numsync = 0;
        self.avail.sz = avail_capacity(self.magic, self.block_sz);
        self.dirty = true;

        let cap = self.avail.sz as usize;
        if self.avail.elems.len() > cap {
            self.avail
                .elems
                .split_off(cap)
                .into_iter()
                .map(|elem| (elem.addr, elem.sz))
                .collect()
        } else {
            Vec::new()
        }
    }
}

/// Reads the numsync counter out of a database header, if the file is in
/// the extended format. Used by snapshot selection; any parse failure is
/// reported as `None` rather than an error.
pub fn peek_numsync(rdr: &mut impl Read) -> io::Result<Option<u32>> {
    let magic = match Magic::from_u32(read_u32(rdr)?) {
        Ok(magic) => magic,
        Err(_) => return Ok(None),
    };
    if !magic.is_numsync() {
        return Ok(None);
    }

    // skip the remaining fixed fields up to the extended words
    let mut skip = [0u8; (HDR_FIXED_SZ - 4) as usize];
    rdr.read_exact(&mut skip)?;

    let version = read_u32(rdr)?;
    let numsync = read_u32(rdr)?;

    Ok((version == 0).then_some(numsync))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_for_512_byte_blocks() {
        let header = Header::new(512, true);
        assert_eq!(header.bucket_elems, 16);
        assert_eq!(header.bucket_sz, 496);
        assert_eq!(header.dir_bits, 6);
        assert_eq!(header.dir_sz, 512);
        assert_eq!(header.dir_ofs, 512);
        assert_eq!(header.initial_bucket_ofs(), 1024);
        assert_eq!(header.next_block, 1536);
        assert_eq!(header.avail.sz, avail_capacity(Magic::Numsync, 512));
    }

    #[test]
    fn serialization_round_trip() {
        let mut header = Header::new(512, true);
        header.numsync = 41;
        header.free(1024, 64, false);

        let mut buf = Vec::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), 512);

        let read = Header::from_reader(header.next_block, &mut &buf[..]).unwrap();
        assert_eq!(read.magic, Magic::Numsync);
        assert_eq!(read.numsync, 41);
        assert_eq!(read.bucket_elems, header.bucket_elems);
        assert_eq!(read.avail.elems, header.avail.elems);
    }

    #[test]
    fn rejects_truncated_file() {
        let mut header = Header::new(512, false);
        header.next_block = 4096;

        let mut buf = Vec::new();
        header.serialize(&mut buf);

        assert!(matches!(
            Header::from_reader(2048, &mut &buf[..]),
            Err(Error::BadHeaderNextBlock { .. })
        ));
    }

    #[test]
    fn rejects_bad_block_size() {
        let mut header = Header::new(512, false);
        header.block_sz = 768; // not a power of two

        let mut buf = Vec::new();
        write_u32(&mut buf, header.magic.as_u32());
        write_u32(&mut buf, header.block_sz);
        buf.resize(512, 0);

        assert!(matches!(
            Header::from_reader(1536, &mut &buf[..]),
            Err(Error::BadHeaderBlockSize { .. })
        ));
    }

    #[test]
    fn unsorted_avail_is_repaired() {
        let mut header = Header::new(512, false);
        header.avail.elems = vec![
            crate::avail::AvailElem { sz: 128, addr: 2048 },
            crate::avail::AvailElem { sz: 16, addr: 4096 },
        ];
        header.next_block = 8192;

        let mut buf = Vec::new();
        header.serialize(&mut buf);

        let read = Header::from_reader(8192, &mut &buf[..]).unwrap();
        assert!(crate::avail::is_sorted(&read.elems_for_test()));
        assert!(read.dirty, "repair must reach disk via the dirty path");
    }

    #[test]
    fn numsync_upgrade_spills_largest() {
        let mut header = Header::new(512, false);
        header.next_block = 1 << 20;
        let cap = header.avail.sz as usize;
        for n in 0..cap {
            header.free(2048 + n as u64 * 512, 16 + n as u32, false);
        }
        assert!(header.avail.is_full());

        let spilled = header.convert_numsync(true);
        assert_eq!(header.magic, Magic::Numsync);
        assert_eq!(header.avail.sz, avail_capacity(Magic::Numsync, 512));
        assert_eq!(
            spilled.len(),
            cap - header.avail.sz as usize,
            "every displaced element must be handed back"
        );
        // largest elements spill, smallest stay
        assert!(spilled.iter().all(|&(_, sz)| {
            header.avail.elems.iter().all(|kept| kept.sz <= sz)
        }));
    }

    impl Header {
        fn elems_for_test(&self) -> Vec<crate::avail::AvailElem> {
            self.avail.elems.clone()
        }
    }
}
