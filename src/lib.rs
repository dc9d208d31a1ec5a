//
// lib.rs -- dynahash core library API routines
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Single-file key/value store built on extensible hashing.
//!
//! A database is one regular file: a header block, a directory of bucket
//! offsets indexed by the top bits of a 31-bit key hash, fixed-size hash
//! buckets, and raw key/value payloads, with freed space recycled through
//! a two-level avail pool. Buckets split and the directory doubles as data
//! grows. Optionally, every sync also clones the file onto one of two
//! alternating reflink snapshots, from which a consistent database can be
//! selected after a crash.
//!
//! # Examples
//! ```
//! # use tempfile::tempdir;
//! # fn main() -> Result<(), String> {
//! #     let tmp_dir = tempdir().map_err(|e| e.to_string())?;
//! #     let passwords = tmp_dir.path().join("top-level-doc-test");
//! #     || -> dynahash::Result<()> {
//! // Create a new database at path
//! let mut db = dynahash::OpenOptions::new()
//!     .write()
//!     .create()
//!     .open(&passwords)?;
//!
//! // Insert key/value pairs
//! db.insert("286755fad04869ca523320acce0dc6a4", "chal28griffin@example.com")?;
//! db.insert("4aacf9c858c82716ab0034320bd2efe9", "floribund@gmail.com")?;
//!
//! // Read a value back
//! let value = db.fetch("4aacf9c858c82716ab0034320bd2efe9")?;
//! assert_eq!(value.as_deref(), Some(&b"floribund@gmail.com"[..]));
//! #         Ok(())
//! #     }().map_err(|e| e.to_string())
//! # }
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

mod avail;
mod bucket;
mod cache;
mod dir;
mod error;
mod hash;
mod header;
mod io;
mod lock;
mod magic;
mod options;
mod recover;
mod ser;
mod snapshot;

use avail::{AvailBlock, AvailElem, AVAIL_BLOCK_HDR_SZ};
use bucket::{Bucket, BucketElement, BUCKET_AVAIL};
use cache::BucketCache;
pub use cache::CacheSize;
use dir::{Directory, MAX_DIR_BITS};
pub use error::{Error, Result};
use hash::{bucket_dir, key_loc, PartialKey};
use header::Header;
pub use header::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use io::{Dio, MapConfig};
pub use io::{DEFAULT_MAX_MAP_SIZE, DEFAULT_MMAP_SIZE};
use lock::LockKind;
pub use magic::Magic;
pub use options::{BlockSize, Create, NotCreate, NotWrite, OpenOptions, Write};
pub use recover::{RecoverOptions, RecoverReport};
use snapshot::SnapshotSet;
pub use snapshot::{latest_snapshot, SnapshotPick};

// freed regions this small are simply forgotten
const IGNORE_SMALL: u32 = 4;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) enum WriteState {
    #[default]
    Clean,
    Dirty,
    /// The handle is poisoned: a write-path failure or structural
    /// validation error happened and mutations are disabled.
    Inconsistent,
}

/// Struct used as type parameter to open a database in read-only mode.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadOnly;

/// Struct used as type parameter to open a database in read-write mode.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadWrite {
    pub(crate) sync: bool,
    pub(crate) state: WriteState,
}

/// Open-time handle configuration, kept for rebinding after recovery and
/// reorganization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Config {
    pub cache_size: CacheSize,
    pub no_lock: bool,
    pub no_mmap: bool,
    pub mmap_size: Option<usize>,
    pub max_map_size: Option<usize>,
    pub close_on_exec: bool,
}

impl Config {
    fn map_config(&self) -> MapConfig {
        MapConfig {
            enabled: !self.no_mmap,
            initial: self.mmap_size.unwrap_or(DEFAULT_MMAP_SIZE),
            max: self.max_map_size.unwrap_or(DEFAULT_MAX_MAP_SIZE),
        }
    }
}

fn resolve_block_size(file: &File, requested: BlockSize) -> Result<u32> {
    let usable = |size: u32| {
        size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
            .next_power_of_two()
            .min(MAX_BLOCK_SIZE)
    };

    match requested {
        BlockSize::Filesystem => Ok(usable(file.metadata().map_err(Error::Io)?.blksize() as u32)),
        BlockSize::Roughly(size) => Ok(usable(size)),
        BlockSize::Exactly(size) => {
            let actual = usable(size);
            if actual != size {
                return Err(Error::BadBlockSize {
                    requested: size,
                    actual,
                });
            }
            Ok(size)
        }
    }
}

trait CacheBucket {
    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()>;
    fn flush_dirty_buckets(&mut self) -> Result<()>;
    fn note_corruption(&mut self);
}

/// Database handle.
///
/// The type parameter is [`ReadOnly`] or [`ReadWrite`]; mutating
/// operations only exist on `Db<ReadWrite>`, so mode violations are
/// compile errors rather than runtime ones.
pub struct Db<R: 'static> {
    pub(crate) dio: Dio,
    pub(crate) path: Option<PathBuf>,
    pub(crate) header: Header,
    pub(crate) dir: Directory,
    pub(crate) cache: BucketCache,
    pub(crate) cfg: Config,

    central_free: bool,
    coalesce: bool,
    cache_size_set: bool,

    pub(crate) snapshots: Option<SnapshotSet>,
    pub(crate) read_write: R,
}

// A read-only handle never holds dirty buckets, so displacement and
// flushing are trivial and corruption cannot poison anything writable.
impl CacheBucket for Db<ReadOnly> {
    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()> {
        let _ = self.cache.insert_mru(offset, bucket, false);

        Ok(())
    }

    fn flush_dirty_buckets(&mut self) -> Result<()> {
        Ok(())
    }

    fn note_corruption(&mut self) {}
}

impl CacheBucket for Db<ReadWrite> {
    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()> {
        if let Some((evicted_ofs, evicted, dirty)) = self.cache.insert_mru(offset, bucket, false) {
            if dirty {
                self.write_bucket_at(evicted_ofs, &evicted)?;
            }
        }

        Ok(())
    }

    fn flush_dirty_buckets(&mut self) -> Result<()> {
        for (offset, idx) in self.cache.dirty_indices() {
            let mut buf = Vec::with_capacity(self.header.bucket_sz as usize);
            self.cache.bucket_at(idx).serialize(&mut buf);
            if let Err(e) = self.dio.write_at(offset, &buf) {
                self.read_write.state = WriteState::Inconsistent;
                return Err(Error::Io(e));
            }
        }
        self.cache.clear_dirty();

        Ok(())
    }

    fn note_corruption(&mut self) {
        self.read_write.state = WriteState::Inconsistent;
    }
}

#[derive(Debug)]
struct Slot {
    bucket: usize,
    element: usize,
}

/// Summary returned by [`Db::check_structure`].
#[derive(Debug, Clone, Copy)]
pub struct StructureReport {
    pub dir_bits: u32,
    pub dir_entries: usize,
    /// Number of distinct buckets.
    pub buckets: usize,
    /// Total live slots, equal to [`Db::len`].
    pub entries: usize,
    pub max_bucket_bits: u32,
}

#[allow(private_bounds)]
impl<R> Db<R>
where
    Db<R>: CacheBucket,
    R: Default,
{
    pub(crate) fn open(
        file: File,
        path: Option<PathBuf>,
        cfg: Config,
        writable: bool,
    ) -> Result<Db<R>> {
        if !cfg.no_lock {
            let kind = match writable {
                true => LockKind::Exclusive,
                false => LockKind::Shared,
            };
            lock::try_lock(&file, kind)?;
        }

        let mut dio = Dio::new(file, writable, cfg.map_config()).map_err(Error::Io)?;
        let (header, dir) = Self::load_metadata(&mut dio)?;

        let cache = BucketCache::new(cfg.cache_size, header.dir_bits);
        let cache_size_set = cfg.cache_size != CacheSize::Auto;

        let mut db = Db {
            dio,
            path,
            header,
            dir,
            cache,
            cfg,
            central_free: false,
            coalesce: false,
            cache_size_set,
            snapshots: None,
            read_write: R::default(),
        };

        if writable {
            db.check_avail_chain()?;
        }

        Ok(db)
    }

    fn load_metadata(dio: &mut Dio) -> Result<(Header, Directory)> {
        let file_len = dio.len();

        let prefix = dio.read_at(0, 8).map_err(Error::Io)?;
        Magic::from_u32(u32::from_ne_bytes(prefix[0..4].try_into().unwrap()))?;
        let block_sz = u32::from_ne_bytes(prefix[4..8].try_into().unwrap());
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_sz) || !block_sz.is_power_of_two() {
            return Err(Error::BadHeaderBlockSize {
                size: block_sz,
                minimum: MIN_BLOCK_SIZE,
                maximum: MAX_BLOCK_SIZE,
            });
        }

        let block = dio.read_at(0, block_sz as usize).map_err(Error::Io)?;
        let header = Header::from_reader(file_len, &mut &block[..])?;

        let dir_bytes = dio
            .read_at(header.dir_ofs, header.dir_sz as usize)
            .map_err(Error::Io)?;
        let dir = Directory::from_reader(header.dir_sz, &mut &dir_bytes[..]).map_err(Error::Io)?;
        dir.validate(header.block_sz, header.bucket_sz, header.next_block)?;

        Ok((header, dir))
    }

    // Every avail-block read validates the block; the chain walk detects
    // cycles through a sorted set of visited offsets.
    fn read_avail_block(&mut self, offset: u64) -> Result<AvailBlock> {
        let hdr = self
            .dio
            .read_at(offset, AVAIL_BLOCK_HDR_SZ as usize)
            .map_err(Error::Io)?;
        let sz = u32::from_ne_bytes(hdr[0..4].try_into().unwrap());
        let extent = AvailBlock::extent_bytes(sz);

        if sz == 0
            || offset < u64::from(self.header.block_sz)
            || offset + u64::from(extent) > self.header.next_block
        {
            return Err(Error::BadAvail {
                offset,
                size: extent,
            });
        }

        let data = self
            .dio
            .read_at(offset, extent as usize)
            .map_err(Error::Io)?;
        let mut block = AvailBlock::from_reader(&mut &data[..]).map_err(Error::Io)?;
        if !block.ensure_sorted() {
            log::warn!("avail block at {} was unsorted; repaired", offset);
        }
        block.validate(self.header.block_sz, self.header.next_block)?;

        Ok(block)
    }

    fn check_avail_chain(&mut self) -> Result<()> {
        let mut visited: BTreeSet<u64> = BTreeSet::new();
        let mut next = self.header.avail.next_block;

        while next != 0 {
            if !visited.insert(next) {
                return Err(Error::BadAvail {
                    offset: next,
                    size: 0,
                });
            }
            next = self.read_avail_block(next)?.next_block;
        }

        Ok(())
    }

    // Establishes the current bucket for a directory index: cache lookup
    // by the directory's offset, disk read and validation on miss, then
    // promotion to the MRU head. Promoting or inserting a clean bucket
    // while dirty entries exist first flushes the dirty prefix, keeping
    // the prefix contiguous.
    fn cache_load_bucket(&mut self, bucket_dir: usize) -> Result<&Bucket> {
        let offset = self.dir.dir[bucket_dir];

        match self.cache.index_of(offset) {
            Some(idx) => {
                if self.cache.mru_index() != Some(idx)
                    && !self.cache.is_dirty(idx)
                    && self.cache.has_dirty()
                {
                    self.flush_dirty_buckets()?;
                }
            }
            None => {
                if offset < u64::from(self.header.block_sz)
                    || offset + u64::from(self.header.bucket_sz) > self.header.next_block
                {
                    self.note_corruption();
                    return Err(Error::BadDirEntry {
                        index: bucket_dir,
                        offset,
                    });
                }

                let data = match self.dio.read_at(offset, self.header.bucket_sz as usize) {
                    Ok(data) => data,
                    Err(e) => {
                        self.note_corruption();
                        return Err(Error::Io(e));
                    }
                };
                let bucket = match Bucket::from_reader(self.header.bucket_elems, &mut &data[..]) {
                    Ok(bucket) => bucket,
                    Err(e) => {
                        self.note_corruption();
                        return Err(Error::Io(e));
                    }
                };

                let avail_ok = bucket
                    .avail
                    .iter()
                    .all(|elem| elem.validate(self.header.block_sz, self.header.next_block).is_ok());
                if bucket.count > self.header.bucket_elems
                    || bucket.bits > self.header.dir_bits
                    || !avail_ok
                {
                    self.note_corruption();
                    return Err(Error::BadBucket {
                        offset,
                        count: bucket.count,
                        bits: bucket.bits,
                        max_count: self.header.bucket_elems,
                        dir_bits: self.header.dir_bits,
                    });
                }

                if self.cache.has_dirty() {
                    self.flush_dirty_buckets()?;
                }
                self.cache_bucket(offset, bucket)?;
            }
        }

        self.cache.promote(offset);

        Ok(self.cache.current_bucket().unwrap())
    }

    /// Gets the number of key/value pairs in the database.
    ///
    /// This is an exact count obtained by walking every distinct bucket.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&mut self) -> Result<usize> {
        let mut len: usize = 0;
        let mut cur_dir: usize = 0;
        while cur_dir < self.dir.len() {
            len += self.cache_load_bucket(cur_dir)?.count as usize;
            cur_dir = self.dir.next_distinct(cur_dir);
        }

        Ok(len)
    }

    // retrieve record data, and slot index in the current bucket, for key
    fn int_get(&mut self, key: &[u8]) -> Result<Option<(usize, Vec<u8>)>> {
        let (key_hash, bucket_dir, elem_ofs) =
            key_loc(self.header.dir_bits, self.header.bucket_elems, key);
        let key_start = PartialKey::new(key);

        let bucket = self.cache_load_bucket(bucket_dir)?;

        let bucket_entries = (0..bucket.tab.len())
            .map(|index| (index + elem_ofs as usize) % bucket.tab.len())
            .map(|slot| (slot, bucket.tab[slot]))
            .take_while(|(_, elem)| elem.is_occupied())
            .filter(|(_, elem)| {
                elem.hash == key_hash
                    && elem.key_size == key.len() as u32
                    && elem.key_start == key_start
            })
            .collect::<Vec<_>>();

        let data_entries = bucket_entries
            .into_iter()
            .map(|(slot, elem)| {
                self.dio
                    .read_at(elem.data_ofs, (elem.key_size + elem.data_size) as usize)
                    .map(|data| (slot, data))
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(Error::Io)?;

        let result = data_entries
            .into_iter()
            .filter(|(_, data)| data[..key.len()] == *key)
            .map(|(slot, data)| (slot, data[key.len()..].to_vec()))
            .next();

        Ok(result)
    }

    /// Checks whether the database contains a specific key. Does not
    /// allocate a result buffer.
    pub fn contains_key<K: AsRef<[u8]>>(&mut self, key: K) -> Result<bool> {
        self.int_get(key.as_ref()).map(|result| result.is_some())
    }

    /// Gets the value stored under `key`, or `None`.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> dynahash::Result<()> {
    /// #         let mut db = dynahash::OpenOptions::new().write().create().open(&path)?;
    /// #         db.insert("badger", "mushroom")?;
    /// if let Some(value) = db.fetch("badger")? {
    ///     println!("{}", String::from_utf8_lossy(&value));
    /// }
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn fetch<K: AsRef<[u8]>>(&mut self, key: K) -> Result<Option<Vec<u8>>> {
        self.int_get(key.as_ref())
            .map(|result| result.map(|(_, data)| data))
    }

    /// Alias for [`fetch`](Db::fetch).
    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> Result<Option<Vec<u8>>> {
        self.fetch(key)
    }

    fn next_slot(&self, slot: &Slot) -> Option<Slot> {
        if slot.element + 1 < self.header.bucket_elems as usize {
            return Some(Slot {
                bucket: slot.bucket,
                element: slot.element + 1,
            });
        }

        let bucket = self.dir.next_distinct(slot.bucket);
        (bucket < self.dir.len()).then_some(Slot { bucket, element: 0 })
    }

    fn next_occupied_slot(&mut self, slot: &Slot) -> Option<Result<Slot>> {
        let mut next = self.next_slot(slot);
        while let Some(slot) = next {
            let occupied = self
                .cache_load_bucket(slot.bucket)
                .map(|bucket| bucket.tab[slot.element].is_occupied());
            match occupied {
                Ok(true) => return Some(Ok(slot)),
                Ok(false) => (),
                Err(e) => return Some(Err(e)),
            }
            next = self.next_slot(&slot);
        }

        None
    }

    fn first_occupied_slot(&mut self) -> Option<Result<Slot>> {
        let slot = Slot {
            bucket: 0,
            element: 0,
        };
        match self.cache_load_bucket(0) {
            Ok(bucket) => {
                if bucket.tab[0].is_occupied() {
                    Some(Ok(slot))
                } else {
                    self.next_occupied_slot(&slot)
                }
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn slot_element(&mut self, slot: &Slot) -> Result<BucketElement> {
        self.cache_load_bucket(slot.bucket)
            .map(|bucket| bucket.tab[slot.element])
    }

    fn read_slot_key(&mut self, slot: &Slot) -> Result<Vec<u8>> {
        let elem = self.slot_element(slot)?;
        self.dio
            .read_at(elem.data_ofs, elem.key_size as usize)
            .map_err(Error::Io)
    }

    /// Returns the first key in scan order: directory index ascending,
    /// slot index ascending, each bucket visited once.
    ///
    /// Together with [`next_key`](Db::next_key) this walks every key
    /// exactly once -- provided the database is not mutated in between;
    /// a store that splits a bucket mid-walk may cause keys to be visited
    /// twice or skipped.
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        match self.first_occupied_slot() {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(slot)) => self.read_slot_key(&slot).map(Some),
        }
    }

    /// Returns the key following `key` in scan order, or `None` at the
    /// end of the database (or when `key` itself is absent).
    pub fn next_key<K: AsRef<[u8]>>(&mut self, key: K) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        let (_, bucket_dir, _) = key_loc(self.header.dir_bits, self.header.bucket_elems, key);

        let element = match self.int_get(key)? {
            None => return Ok(None),
            Some((element, _)) => element,
        };

        let slot = Slot {
            bucket: bucket_dir,
            element,
        };
        match self.next_occupied_slot(&slot) {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(next)) => self.read_slot_key(&next).map(Some),
        }
    }

    /// Get an [`Iterator`] over the `(key, value)` pairs in the database.
    ///
    /// Iteration order is the scan order of [`first_key`](Db::first_key);
    /// it is not stable under concurrent mutation.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().map_err(|e| e.to_string())?;
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> dynahash::Result<()> {
    /// #         let mut db = dynahash::OpenOptions::new().write().create().open(&path)?;
    /// for kv in db.iter() {
    ///     let (key, value) = kv?;
    ///     println!("{:?} => {} bytes", key, value.len());
    /// }
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn iter(&mut self) -> impl std::iter::Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_ {
        DbIterator::new(self, KeyOrValue::Both)
    }

    /// Get an [`Iterator`] over the keys in the database.
    pub fn keys(&mut self) -> impl std::iter::Iterator<Item = Result<Vec<u8>>> + '_ {
        DbIterator::new(self, KeyOrValue::Key).map(|kv| kv.map(|(key, _)| key))
    }

    /// Get an [`Iterator`] over the values in the database.
    pub fn values(&mut self) -> impl std::iter::Iterator<Item = Result<Vec<u8>>> + '_ {
        DbIterator::new(self, KeyOrValue::Value).map(|kv| kv.map(|(_, value)| value))
    }

    /// Verifies the structural invariants of the whole database.
    ///
    /// Walks every distinct bucket and checks the directory runs (length
    /// `2^(dir_bits - bucket_bits)`, aligned and contiguous), the bucket
    /// geometry, the probe chains (every live slot reachable from its
    /// home slot without crossing an empty one) and the avail pools.
    /// Returns a small summary on success.
    pub fn check_structure(&mut self) -> Result<StructureReport> {
        let mut report = StructureReport {
            dir_bits: self.header.dir_bits,
            dir_entries: self.dir.len(),
            buckets: 0,
            entries: 0,
            max_bucket_bits: 0,
        };

        let mut cur = 0;
        while cur < self.dir.len() {
            let start = cur;
            let offset = self.dir.dir[cur];
            cur = self.dir.next_distinct(cur);
            let run_len = cur - start;

            let bucket = self.cache_load_bucket(start)?;
            let (bits, count) = (bucket.bits, bucket.count);

            let probe_ok = {
                let tab = &bucket.tab;
                let len = tab.len();
                tab.iter()
                    .enumerate()
                    .filter(|(_, elem)| elem.is_occupied())
                    .all(|(at, elem)| {
                        let mut slot = elem.hash as usize % len;
                        for _ in 0..len {
                            if slot == at {
                                return true;
                            }
                            if !tab[slot].is_occupied() {
                                return false;
                            }
                            slot = (slot + 1) % len;
                        }
                        false
                    })
            };

            if bits > self.header.dir_bits
                || run_len != 1usize << (self.header.dir_bits - bits)
                || start % run_len != 0
                || !probe_ok
            {
                return Err(Error::BadBucket {
                    offset,
                    count,
                    bits,
                    max_count: self.header.bucket_elems,
                    dir_bits: self.header.dir_bits,
                });
            }

            report.buckets += 1;
            report.entries += count as usize;
            report.max_bucket_bits = report.max_bucket_bits.max(bits);
        }

        self.header
            .avail
            .validate(self.header.block_sz, self.header.next_block)?;
        self.check_avail_chain()?;

        Ok(report)
    }

    /// Gets the database [`Magic`] number.
    pub fn magic(&self) -> Magic {
        self.header.magic
    }

    /// Block size the database was created with.
    pub fn block_size(&self) -> u32 {
        self.header.block_sz
    }

    /// Is the database in the extended (numsync) format?
    pub fn is_numsync(&self) -> bool {
        self.header.magic.is_numsync()
    }

    /// Path of the database file, absent for anonymous tempfile handles.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current bucket-cache capacity, in entries.
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Are freed regions routed to the master avail pool?
    pub fn central_free(&self) -> bool {
        self.central_free
    }

    /// Are adjacent freed regions merged?
    pub fn coalesce_blocks(&self) -> bool {
        self.coalesce
    }

    /// Replaces the bucket cache capacity policy.
    ///
    /// May be used once per handle (the policy given at open time counts);
    /// a second call fails with [`Error::OptAlreadySet`].
    pub fn set_cache_size(&mut self, size: CacheSize) -> Result<()> {
        if self.cache_size_set {
            return Err(Error::OptAlreadySet);
        }

        self.flush_dirty_buckets()?;
        self.cfg.cache_size = size;
        self.cache = BucketCache::new(size, self.header.dir_bits);
        self.cache_size_set = true;

        Ok(())
    }
}

impl Db<ReadOnly> {
    /// Closes the database, releasing the lock and all memory.
    pub fn close(self) {}
}

impl Db<ReadWrite> {
    pub(crate) fn create(
        file: File,
        path: Option<PathBuf>,
        cfg: Config,
        sync: bool,
        block_size: BlockSize,
        numsync: bool,
    ) -> Result<Db<ReadWrite>> {
        if !cfg.no_lock {
            lock::try_lock(&file, LockKind::Exclusive)?;
        }

        let block_sz = resolve_block_size(&file, block_size)?;
        file.set_len(0).map_err(Error::Io)?;
        let dio = Dio::new(file, true, cfg.map_config()).map_err(Error::Io)?;

        let header = Header::new(block_sz, numsync);
        let bucket = Bucket::new(0, header.bucket_elems as usize);
        let bucket_ofs = header.initial_bucket_ofs();
        let mut dir = Directory::new(vec![bucket_ofs; 1 << header.dir_bits]);
        dir.dirty = true;

        let mut cache = BucketCache::new(cfg.cache_size, header.dir_bits);
        let _ = cache.insert_mru(bucket_ofs, bucket, true);
        let cache_size_set = cfg.cache_size != CacheSize::Auto;

        let mut db = Db {
            dio,
            path,
            header,
            dir,
            cache,
            cfg,
            central_free: false,
            coalesce: false,
            cache_size_set,
            snapshots: None,
            read_write: ReadWrite {
                sync,
                state: WriteState::Dirty,
            },
        };

        if db.read_write.sync {
            db.sync()?;
        }

        Ok(db)
    }

    /// Set the database sync mode.
    ///
    /// When sync mode is enabled, all database state is flushed to stable
    /// storage after every mutating operation, not just on an explicit
    /// [`sync`](Db::sync).
    pub fn set_sync(&mut self, sync: bool) {
        self.read_write.sync = sync;
    }

    /// Is sync-after-every-mutation enabled?
    pub fn sync_mode(&self) -> bool {
        self.read_write.sync
    }

    /// Route freed regions to the master avail pool instead of the
    /// current bucket's pool.
    pub fn set_central_free(&mut self, central_free: bool) {
        self.central_free = central_free;
    }

    /// Merge freed regions with adjacent free regions.
    pub fn set_coalesce_blocks(&mut self, coalesce: bool) {
        self.coalesce = coalesce;
    }

    // virtually allocate space at end of file (no I/O); the file itself
    // is extended to the watermark by sync
    fn extend(&mut self, size: u32) -> (u64, u32) {
        let offset = self.header.next_block;
        let length = size.div_ceil(self.header.block_sz) * self.header.block_sz;

        self.header.next_block += u64::from(length);
        self.header.dirty = true;

        (offset, length)
    }

    // Master avail pool is full: keep half inline, move the other half
    // into a freshly allocated chained block.
    fn push_avail_block(&mut self) -> Result<()> {
        let (keep, spill) = self.header.avail.partition();
        let capacity = self.header.avail.sz;
        let chain = self.header.avail.next_block;

        self.header.avail.elems = keep;
        self.header.dirty = true;

        let block = AvailBlock::new(capacity, chain, spill);
        let extent = AvailBlock::extent_bytes(capacity);
        let offset = self.allocate_record(extent)?;

        let mut buf = Vec::with_capacity(extent as usize);
        block.serialize(&mut buf);
        self.dio.write_at(offset, &buf).map_err(Error::Io)?;

        self.header.avail.next_block = offset;

        Ok(())
    }

    // Master avail pool is empty: absorb the first chained block, if any.
    // Elements that no longer fit are re-homed through the free path.
    fn pop_avail_block(&mut self) -> Result<()> {
        let block_ofs = self.header.avail.next_block;
        let block = self.read_avail_block(block_ofs)?;
        let extent = AvailBlock::extent_bytes(block.sz);

        let overflow = self.header.avail.absorb(block, self.coalesce);
        self.header.dirty = true;

        self.free_record(block_ofs, extent)?;
        for elem in overflow {
            self.free_record(elem.addr, elem.sz)?;
        }

        Ok(())
    }

    // Allocation from the current bucket's pool, without dirtying the
    // bucket when nothing fits.
    fn bucket_avail_allocate(&mut self, size: u32) -> Option<AvailElem> {
        let fits = self
            .cache
            .current_bucket()
            .map_or(false, |bucket| bucket.avail.iter().any(|elem| elem.sz >= size));
        if !fits {
            return None;
        }

        self.cache.current_bucket_mut().unwrap().allocate(size)
    }

    fn free_to_master(&mut self, addr: u64, sz: u32) -> Result<()> {
        if sz <= IGNORE_SMALL {
            return Ok(());
        }

        self.header.free(addr, sz, self.coalesce);
        if self.header.avail.is_full() {
            self.push_avail_block()?;
        }

        Ok(())
    }

    fn free_to_bucket(&mut self, addr: u64, sz: u32) -> Result<()> {
        if sz <= IGNORE_SMALL {
            return Ok(());
        }

        let coalesce = self.coalesce;
        match self.cache.current_bucket_mut() {
            Some(bucket) => match bucket.free(addr, sz, coalesce) {
                Some(spill) => self.free_to_master(spill.addr, spill.sz),
                None => Ok(()),
            },
            None => self.free_to_master(addr, sz),
        }
    }

    // Returns (addr, sz) to the free pools: the current bucket's for
    // small regions, the master pool for block-sized ones or when the
    // central-free option is set.
    fn free_record(&mut self, addr: u64, sz: u32) -> Result<()> {
        if sz <= IGNORE_SMALL {
            return Ok(());
        }

        if self.central_free || sz >= self.header.block_sz {
            self.free_to_master(addr, sz)
        } else {
            self.free_to_bucket(addr, sz)
        }
    }

    // Allocates `size` bytes: current bucket's pool, then the master pool
    // (popping a chained block when empty), then file extension. The
    // unused remainder returns to the pool it came from.
    fn allocate_record(&mut self, size: u32) -> Result<u64> {
        if let Some(elem) = self.bucket_avail_allocate(size) {
            if elem.sz > size {
                self.free_to_bucket(elem.addr + u64::from(size), elem.sz - size)?;
            }
            return Ok(elem.addr);
        }

        if self.header.avail.elems.is_empty() && self.header.avail.next_block != 0 {
            self.pop_avail_block()?;
        }

        let (offset, length) = match self.header.allocate(size) {
            Some(block) => block,
            None => self.extend(size),
        };
        if length > size {
            self.free_to_master(offset + u64::from(size), length - size)?;
        }

        Ok(offset)
    }

    fn write_bucket_at(&mut self, offset: u64, bucket: &Bucket) -> Result<()> {
        let mut buf = Vec::with_capacity(self.header.bucket_sz as usize);
        bucket.serialize(&mut buf);
        self.dio.write_at(offset, &buf).map_err(Error::Io)
    }

    fn write_dir(&mut self) -> std::io::Result<()> {
        if !self.dir.dirty {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(self.dir.extent() as usize);
        self.dir.serialize(&mut buf);
        self.dio.write_at(self.header.dir_ofs, &buf)?;

        self.dir.dirty = false;

        Ok(())
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        if !self.header.dirty {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(self.header.block_sz as usize);
        self.header.serialize(&mut buf);
        self.dio.write_at(0, &buf)?;

        self.header.dirty = false;

        Ok(())
    }

    // write out any cached, not-yet-written metadata to storage:
    // dirty buckets, then the directory, then the header
    fn write_dirty(&mut self) -> Result<()> {
        self.read_write.state = WriteState::Inconsistent;

        self.flush_dirty_buckets()?;
        self.write_dir().map_err(Error::Io)?;
        self.write_header().map_err(Error::Io)?;

        self.read_write.state = WriteState::Clean;

        Ok(())
    }

    /// Writes all database state to the database file and makes it
    /// durable.
    ///
    /// Order: dirty buckets, directory, header (with the numsync counter
    /// incremented first), file extension to the allocation watermark,
    /// fsync. If crash-tolerant snapshots are armed, a snapshot step runs
    /// afterwards.
    pub fn sync(&mut self) -> Result<()> {
        match self.read_write.state {
            WriteState::Clean => Ok(()),
            WriteState::Inconsistent => Err(Error::NeedsRecovery),
            WriteState::Dirty => {
                self.header.increment_numsync();
                self.write_dirty()?;

                let sync_result = (|| {
                    if self.dio.len() < self.header.next_block {
                        self.dio.truncate(self.header.next_block)?;
                    }
                    self.dio.sync_data()
                })();
                if let Err(e) = sync_result {
                    self.read_write.state = WriteState::Inconsistent;
                    return Err(Error::Io(e));
                }

                if let Some(mut snapshots) = self.snapshots.take() {
                    let stepped = snapshots.advance(self.dio.file());
                    self.snapshots = Some(snapshots);
                    stepped?;
                }

                Ok(())
            }
        }
    }

    fn int_remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.read_write.state == WriteState::Inconsistent {
            return Err(Error::NeedsRecovery);
        }

        let get_opt = self.int_get(key)?;

        if get_opt.is_none() {
            return Ok(None);
        }

        self.read_write.state = WriteState::Inconsistent;

        let (elem_ofs, data) = get_opt.unwrap();

        let elem = self.cache.current_bucket_mut().unwrap().remove(elem_ofs);

        // release record bytes to the free pools
        self.free_record(elem.data_ofs, elem.key_size + elem.data_size)?;

        self.read_write.state = WriteState::Dirty;

        Ok(Some(data))
    }

    /// Removes the entry for `key`, returning the previous value if there
    /// was one.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> dynahash::Result<()> {
    /// #         let mut db = dynahash::OpenOptions::new().write().create().open(&path)?;
    /// match db.remove("sylvian")? {
    ///     Some(old) => println!("removed {:?}", old),
    ///     None => println!("\"sylvian\" wasn't in the database"),
    /// };
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn remove<K: AsRef<[u8]>>(&mut self, key: K) -> Result<Option<Vec<u8>>> {
        self.int_remove(key.as_ref()).and_then(|old_value| {
            if old_value.is_some() && self.read_write.sync {
                self.sync()?;
            }

            Ok(old_value)
        })
    }

    fn int_insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if self.read_write.state == WriteState::Inconsistent {
            return Err(Error::NeedsRecovery);
        }
        self.read_write.state = WriteState::Inconsistent;

        let offset = self.allocate_record((key.len() + data.len()) as u32)?;

        let mut payload = Vec::with_capacity(key.len() + data.len());
        payload.extend_from_slice(key);
        payload.extend_from_slice(data);
        self.dio.write_at(offset, &payload).map_err(Error::Io)?;

        let bucket_elem = BucketElement::new(key, data, offset);
        self.cache_load_bucket(bucket_dir(self.header.dir_bits, bucket_elem.hash))?;

        while self.cache.current_bucket().unwrap().count == self.header.bucket_elems {
            self.split_bucket()?;
            self.cache_load_bucket(bucket_dir(self.header.dir_bits, bucket_elem.hash))?;
        }

        self.cache.current_bucket_mut().unwrap().insert(bucket_elem);

        self.read_write.state = WriteState::Dirty;

        Ok(())
    }

    /// Stores `value` under `key`, replacing any existing value. Returns
    /// the previous value if there was one.
    ///
    /// Zero-length values are legal; zero-length keys are rejected with
    /// [`Error::EmptyKey`].
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> dynahash::Result<()> {
    /// #         let mut db = dynahash::OpenOptions::new().write().create().open(&path)?;
    /// db.insert("marmite", "dog")?;
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        self.int_remove(key)
            .and_then(|old_value| self.int_insert(key, value.as_ref()).map(|()| old_value))
            .and_then(|old_value| {
                if self.read_write.sync {
                    self.sync()?;
                }

                Ok(old_value)
            })
    }

    /// Stores `value` under `key` only if the key is absent. When the key
    /// already exists the stored value is returned unchanged.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> dynahash::Result<()> {
    /// #         let mut db = dynahash::OpenOptions::new().write().create().open(&path)?;
    /// match db.try_insert("marmite", "cat")? {
    ///     Some(v) => println!("marmite exists and is a {:?}", v),
    ///     None => println!("added marmite to the database"),
    /// };
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn try_insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        match self.int_get(key)? {
            Some((_, old_value)) => Ok(Some(old_value)),
            None => self
                .int_insert(key, value.as_ref())
                .map(|()| None)
                .and_then(|result| {
                    if self.read_write.sync {
                        self.sync()?;
                    }

                    Ok(result)
                }),
        }
    }

    // Splits the current (full) bucket into two children one bit deeper,
    // doubling the directory first when the bucket is already at the
    // directory's depth. Cache and directory updates complete before the
    // old bucket's file region is released.
    fn split_bucket(&mut self) -> Result<()> {
        let cur_ofs = self.cache.current_offset().unwrap();

        {
            let bucket = self.cache.current_bucket().unwrap();
            if bucket.live_slots() != bucket.count {
                let err = Error::BadBucket {
                    offset: cur_ofs,
                    count: bucket.count,
                    bits: bucket.bits,
                    max_count: self.header.bucket_elems,
                    dir_bits: self.header.dir_bits,
                };
                self.note_corruption();
                return Err(err);
            }

            if bucket.bits == self.header.dir_bits {
                self.extend_directory()?;
            }
        }

        // space for the two children and the fresh avail seed of the
        // second one; these allocations may consume the old bucket's pool,
        // which the first child is about to inherit
        let bucket_sz = self.header.bucket_sz;
        let block_sz = self.header.block_sz;
        let bucket0_ofs = self.allocate_record(bucket_sz)?;
        let bucket1_ofs = self.allocate_record(bucket_sz)?;
        let seed_ofs = self.allocate_record(block_sz)?;

        let (mut bucket0, mut bucket1) = self.cache.current_bucket().unwrap().split();
        bucket1.avail.push(AvailElem {
            sz: block_sz,
            addr: seed_ofs,
        });
        if bucket0.avail.len() >= BUCKET_AVAIL {
            let spill = bucket0.avail.remove(0);
            avail::insert_elem(&mut bucket1.avail, spill.addr, spill.sz, false);
        }
        let new_bits = bucket0.bits;

        // children go right behind the MRU entry (the old bucket), so the
        // dirty prefix stays contiguous
        for (offset, bucket) in [(bucket1_ofs, bucket1), (bucket0_ofs, bucket0)] {
            if let Some((evicted_ofs, evicted, dirty)) = self.cache.insert_after_mru(offset, bucket)
            {
                if dirty {
                    self.write_bucket_at(evicted_ofs, &evicted)?;
                }
            }
        }

        self.dir.update_split(
            self.header.dir_bits,
            new_bits,
            cur_ofs,
            bucket0_ofs,
            bucket1_ofs,
        );

        // retire the old bucket, then release its region
        self.cache.remove(cur_ofs);
        self.free_record(cur_ofs, bucket_sz)?;

        log::debug!(
            "split bucket at {} into {}/{} ({} bits)",
            cur_ofs,
            bucket0_ofs,
            bucket1_ofs,
            new_bits
        );

        Ok(())
    }

    // Doubles the directory. The new directory is live (in memory, marked
    // dirty) before the old directory's file region is freed.
    fn extend_directory(&mut self) -> Result<()> {
        if self.header.dir_bits + 1 > MAX_DIR_BITS {
            return Err(Error::DirOverflow {
                dir_bits: self.header.dir_bits,
            });
        }

        let directory = self.dir.extend();
        let size = directory.extent();
        let offset = self.allocate_record(size)?;

        let (old_ofs, old_sz) = (self.header.dir_ofs, self.header.dir_sz);
        self.header.dir_bits += 1;
        self.header.dir_ofs = offset;
        self.header.dir_sz = size;
        self.header.dirty = true;
        self.dir = directory;
        self.cache.set_auto_ceiling(self.header.dir_bits);

        self.free_record(old_ofs, old_sz)?;

        log::debug!("directory doubled to {} bits", self.header.dir_bits);

        Ok(())
    }

    /// Converts the database between the standard and extended (numsync)
    /// formats in place.
    ///
    /// Upgrading shrinks the master avail pool by the size of the
    /// extended fields; displaced free regions are re-homed, never lost.
    pub fn set_numsync(&mut self, numsync: bool) -> Result<()> {
        if self.read_write.state == WriteState::Inconsistent {
            return Err(Error::NeedsRecovery);
        }
        self.read_write.state = WriteState::Inconsistent;

        let displaced = self.header.convert_numsync(numsync);
        for (addr, sz) in displaced {
            self.free_record(addr, sz)?;
        }

        self.read_write.state = WriteState::Dirty;

        Ok(())
    }

    // Reopens the handle on the (replaced) database file at `path`.
    pub(crate) fn rebind(&mut self, path: &Path) -> Result<()> {
        let mut fs_options = std::fs::OpenOptions::new();
        fs_options.read(true).write(true);
        if self.cfg.close_on_exec {
            fs_options.custom_flags(libc::O_CLOEXEC);
        }
        let file = fs_options.open(path).map_err(Error::Io)?;

        if !self.cfg.no_lock {
            lock::try_lock(&file, LockKind::Exclusive)?;
        }

        let mut dio = Dio::new(file, true, self.cfg.map_config()).map_err(Error::Io)?;
        let (header, dir) = Self::load_metadata(&mut dio)?;

        self.cache.reset();
        self.cache.set_auto_ceiling(header.dir_bits);
        self.dio = dio;
        self.header = header;
        self.dir = dir;
        self.read_write.state = WriteState::Clean;

        Ok(())
    }

    /// Rewrites the database compactly: live entries are copied into a
    /// fresh database which then atomically replaces the original file.
    ///
    /// Requires a named database; tempfile handles fail with
    /// [`Error::NoDbName`].
    pub fn reorganize(&mut self) -> Result<()> {
        if self.read_write.state == WriteState::Inconsistent {
            return Err(Error::NeedsRecovery);
        }

        let path = self.path.clone().ok_or(Error::NoDbName)?;
        let permissions = std::fs::metadata(&path).map_err(Error::Io)?.permissions();

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let scratch = tempfile::Builder::new()
            .prefix(".dynahash-reorganize-")
            .tempfile_in(&parent)
            .map_err(Error::Io)?;
        let scratch_path = scratch.into_temp_path();

        let mut out = OpenOptions::new()
            .no_lock(self.cfg.no_lock)
            .no_mmap(self.cfg.no_mmap)
            .write()
            .create()
            .newdb(true)
            .block_size(BlockSize::Exactly(self.header.block_sz))
            .numsync(self.header.magic.is_numsync())
            .open(&scratch_path)?;
        out.header.numsync = self.header.numsync;

        for kv in DbIterator::new(self, KeyOrValue::Both) {
            let (key, value) = kv?;
            out.insert(&key, &value)?;
        }

        out.sync()?;
        out.close()?;

        scratch_path.persist(&path).map_err(|e| Error::Io(e.error))?;
        std::fs::set_permissions(&path, permissions).map_err(Error::Io)?;

        self.rebind(&path)?;
        log::info!("reorganized {}", path.display());

        Ok(())
    }

    /// Syncs and closes the database, reporting any final write error.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

impl<R> Drop for Db<R> {
    fn drop(&mut self) {
        let db: &mut dyn Any = self as &mut dyn Any;
        if let Some(db) = db.downcast_mut::<Db<ReadWrite>>() {
            if let Err(e) = db.sync() {
                log::warn!("sync on close failed: {}", e);
            }
        }
    }
}

enum KeyOrValue {
    Key,
    Value,
    Both,
}

struct DbIterator<'a, R: 'static> {
    key_or_value: KeyOrValue,
    db: &'a mut Db<R>,
    slot: Option<Result<Slot>>,
}

impl<'a, R> DbIterator<'a, R>
where
    Db<R>: CacheBucket,
    R: Default + 'static,
{
    fn new(db: &'a mut Db<R>, key_or_value: KeyOrValue) -> DbIterator<'a, R> {
        let slot = db.first_occupied_slot();
        Self {
            key_or_value,
            db,
            slot,
        }
    }
}

impl<'a, R> Iterator for DbIterator<'a, R>
where
    Db<R>: CacheBucket,
    R: Default + 'static,
{
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = match self.slot.take() {
            None => return None,
            Some(Err(e)) => return Some(Err(e)),
            Some(Ok(slot)) => slot,
        };

        let elem = match self.db.slot_element(&slot) {
            Ok(elem) => elem,
            Err(e) => return Some(Err(e)),
        };

        let data = match self.key_or_value {
            KeyOrValue::Key => self
                .db
                .dio
                .read_at(elem.data_ofs, elem.key_size as usize)
                .map(|key| (key, Vec::new())),
            KeyOrValue::Value => self
                .db
                .dio
                .read_at(
                    elem.data_ofs + u64::from(elem.key_size),
                    elem.data_size as usize,
                )
                .map(|value| (Vec::new(), value)),
            KeyOrValue::Both => self
                .db
                .dio
                .read_at(elem.data_ofs, (elem.key_size + elem.data_size) as usize)
                .map(|data| {
                    let (key, value) = data.split_at(elem.key_size as usize);
                    (key.to_vec(), value.to_vec())
                }),
        };

        match data {
            Ok(data) => {
                self.slot = self.db.next_occupied_slot(&slot);
                Some(Ok(data))
            }
            Err(e) => Some(Err(Error::Io(e))),
        }
    }
}
