//
// recover.rs -- salvage a damaged database
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::bucket::Bucket;
use crate::hash::hash_key;
use crate::options::BlockSize;
use crate::{Db, Error, OpenOptions, ReadWrite, Result, WriteState};

/// Knobs for [`Db::recover`].
#[derive(Debug, Default, Clone)]
pub struct RecoverOptions {
    /// Rename the damaged file to `<name>.YYYYMMDDHHMMSS` instead of
    /// overwriting it.
    pub backup: bool,
    /// Rebuild even when the handle looks healthy.
    pub force: bool,
    /// Abort once this many keys failed to salvage.
    pub max_failed_keys: Option<usize>,
    /// Abort once this many buckets failed to salvage.
    pub max_failed_buckets: Option<usize>,
    /// Abort once this many keys plus buckets failed.
    pub max_failures: Option<usize>,
}

/// What a recovery run found and kept.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoverReport {
    pub recovered_keys: usize,
    pub recovered_buckets: usize,
    pub failed_keys: usize,
    pub failed_buckets: usize,
    pub duplicate_keys: usize,
    pub backup_path: Option<PathBuf>,
}

impl RecoverReport {
    fn over_threshold(&self, options: &RecoverOptions) -> bool {
        let too_many = |limit: Option<usize>, n: usize| limit.is_some_and(|max| n > max);

        too_many(options.max_failed_keys, self.failed_keys)
            || too_many(options.max_failed_buckets, self.failed_buckets)
            || too_many(options.max_failures, self.failed_keys + self.failed_buckets)
    }
}

fn backup_name(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", stamp));

    PathBuf::from(name)
}

impl Db<ReadWrite> {
    // Permissive bucket read used only by recovery: structural problems
    // are reported to the caller instead of poisoning the handle.
    fn salvage_bucket(&mut self, offset: u64) -> Result<Bucket> {
        if offset < u64::from(self.header.block_sz)
            || offset + u64::from(self.header.bucket_sz) > self.header.next_block
        {
            return Err(Error::BadDirEntry { index: 0, offset });
        }

        let data = self
            .dio
            .read_at(offset, self.header.bucket_sz as usize)
            .map_err(Error::Io)?;
        let bucket =
            Bucket::from_reader(self.header.bucket_elems, &mut &data[..]).map_err(Error::Io)?;

        if bucket.count > self.header.bucket_elems
            || bucket.bits > self.header.dir_bits
            || bucket.live_slots() != bucket.count
        {
            return Err(Error::BadBucket {
                offset,
                count: bucket.count,
                bits: bucket.bits,
                max_count: self.header.bucket_elems,
                dir_bits: self.header.dir_bits,
            });
        }

        Ok(bucket)
    }

    // Reads and cross-checks one slot's payload.
    fn salvage_payload(&mut self, elem: &crate::bucket::BucketElement) -> Result<(Vec<u8>, Vec<u8>)> {
        let total = u64::from(elem.key_size) + u64::from(elem.data_size);
        if elem.key_size == 0
            || elem.data_ofs < u64::from(self.header.block_sz)
            || elem.data_ofs + total > self.header.next_block
        {
            return Err(Error::MalformedData {
                offset: elem.data_ofs,
            });
        }

        let data = self
            .dio
            .read_at(elem.data_ofs, total as usize)
            .map_err(Error::Io)?;
        let (key, value) = data.split_at(elem.key_size as usize);

        if hash_key(key) != elem.hash {
            return Err(Error::MalformedData {
                offset: elem.data_ofs,
            });
        }

        Ok((key.to_vec(), value.to_vec()))
    }

    /// Rebuilds a consistent database from this possibly-damaged one.
    ///
    /// Every bucket reachable from the directory is scanned and every
    /// payload that still checks out is copied into a fresh database,
    /// which then atomically replaces the original file. The handle is
    /// rebound to the rebuilt database and un-poisoned.
    ///
    /// A healthy handle returns an empty report unless
    /// [`force`](RecoverOptions::force) is set.
    pub fn recover(&mut self, options: &RecoverOptions) -> Result<RecoverReport> {
        let path = self.path.clone().ok_or(Error::NoDbName)?;

        if !options.force && self.read_write.state != WriteState::Inconsistent {
            return Ok(RecoverReport::default());
        }

        // salvage reads buckets straight from disk, so pending writes on a
        // healthy handle must land first
        if self.read_write.state == WriteState::Dirty {
            self.sync()?;
        }

        log::info!("recovering {}", path.display());

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let scratch = tempfile::Builder::new()
            .prefix(".dynahash-recover-")
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

        let mut report = RecoverReport::default();
        let mut cur_dir = 0;
        while cur_dir < self.dir.len() {
            let offset = self.dir.dir[cur_dir];
            cur_dir = self.dir.next_distinct(cur_dir);

            let bucket = match self.salvage_bucket(offset) {
                Ok(bucket) => bucket,
                Err(e) => {
                    log::warn!("skipping bucket at {}: {}", offset, e);
                    report.failed_buckets += 1;
                    if report.over_threshold(options) {
                        return Err(Error::RecoveryAborted {
                            failed_keys: report.failed_keys,
                            failed_buckets: report.failed_buckets,
                        });
                    }
                    continue;
                }
            };
            report.recovered_buckets += 1;

            let live: Vec<_> = bucket
                .tab
                .iter()
                .filter(|elem| elem.is_occupied())
                .copied()
                .collect();
            for elem in live {
                match self.salvage_payload(&elem) {
                    Ok((key, value)) => match out.try_insert(&key, &value)? {
                        Some(_) => report.duplicate_keys += 1,
                        None => report.recovered_keys += 1,
                    },
                    Err(e) => {
                        log::warn!("skipping record at {}: {}", elem.data_ofs, e);
                        report.failed_keys += 1;
                        if report.over_threshold(options) {
                            return Err(Error::RecoveryAborted {
                                failed_keys: report.failed_keys,
                                failed_buckets: report.failed_buckets,
                            });
                        }
                    }
                }
            }
        }

        out.sync()?;
        out.close()?;

        if options.backup {
            let backup = backup_name(&path);
            fs::rename(&path, &backup).map_err(|e| Error::BackupFailed {
                path: backup.clone(),
                source: e,
            })?;
            report.backup_path = Some(backup);
        }

        scratch_path
            .persist(&path)
            .map_err(|e| Error::Io(e.error))?;

        self.rebind(&path)?;

        log::info!(
            "recovered {} keys in {} buckets ({} keys failed, {} buckets failed, {} duplicates)",
            report.recovered_keys,
            report.recovered_buckets,
            report.failed_keys,
            report.failed_buckets,
            report.duplicate_keys
        );

        Ok(report)
    }
}
