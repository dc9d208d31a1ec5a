//
// error.rs -- dynahash error types
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The crate error type.
///
/// I/O errors carry the underlying [`io::Error`] (and therefore the last
/// OS errno). Structural errors carry the file coordinates that failed
/// validation.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File does not start with a recognized magic number.
    #[error("unknown magic number {magic:#010x}")]
    BadMagic { magic: u32 },

    /// File was written on a host with the opposite byte order.
    #[error("database is byte-swapped (written on an opposite-endian host)")]
    ByteSwapped,

    /// Another process holds a conflicting lock on the database file.
    #[error("could not acquire database file lock")]
    CannotLock,

    /// Block size found in header is out of range or not a power of two.
    #[error("bad header: block size {size} (must be a power of two in {minimum}..={maximum})")]
    BadHeaderBlockSize { size: u32, minimum: u32, maximum: u32 },

    /// Next block offset in header is beyond the end of the file.
    #[error("bad header: next block {next_block} exceeds file size {file_size}")]
    BadHeaderNextBlock { next_block: u64, file_size: u64 },

    /// Directory offset/size/bits in the header are inconsistent.
    #[error("bad header: directory offset {offset} size {size} bits {bits}")]
    BadHeaderDirectory { offset: u64, size: u32, bits: u32 },

    /// Bucket size or element count in header inconsistent with block size.
    #[error("bad header: bucket size {size}, {elems} elems (expected {expected} elems)")]
    BadHeaderBucket { size: u32, elems: u32, expected: u32 },

    /// Master avail block in the header is malformed.
    #[error("bad header: avail capacity {capacity}, count {count}")]
    BadHeaderAvail { capacity: u32, count: u32 },

    /// Extended-format version field is unrecognized.
    #[error("bad header: extended format version {version}")]
    BadHeaderVersion { version: u32 },

    /// Could not use the supplied block size and an exact size was required.
    #[error("requested block size {requested}, would use {actual}")]
    BadBlockSize { requested: u32, actual: u32 },

    /// The directory region is outside the file.
    #[error("bad directory: offset {offset}, length {length}")]
    BadDirectory { offset: u64, length: u32 },

    /// A directory entry points outside the allocated file region.
    #[error("bad directory entry {index}: bucket offset {offset}")]
    BadDirEntry { index: usize, offset: u64 },

    /// Bucket failed validation on load or during a split.
    #[error("bad bucket at {offset}: count {count}/{max_count}, bits {bits}/{dir_bits}")]
    BadBucket {
        offset: u64,
        count: u32,
        bits: u32,
        max_count: u32,
        dir_bits: u32,
    },

    /// An avail element or avail-block chain failed validation.
    #[error("bad avail element: offset {offset}, size {size}")]
    BadAvail { offset: u64, size: u32 },

    /// A stored record does not match its bucket slot metadata.
    #[error("malformed record data at offset {offset}")]
    MalformedData { offset: u64 },

    /// The directory cannot be doubled any further.
    #[error("directory overflow: {dir_bits} bits is the maximum")]
    DirOverflow { dir_bits: u32 },

    /// Zero-length keys are not storable.
    #[error("zero-length key")]
    EmptyKey,

    /// The handle was poisoned by an earlier write or validation failure.
    /// Only `close` and `recover` are permitted.
    #[error("database needs recovery; writes are disabled")]
    NeedsRecovery,

    /// Operation requires a named database file (not a tempfile handle).
    #[error("database has no file name")]
    NoDbName,

    /// A tunable that may only be set once was set again.
    #[error("option was already set")]
    OptAlreadySet,

    /// Snapshot file already exists at arming time.
    #[error("snapshot file already exists: {}", path.display())]
    SnapshotExists { path: PathBuf },

    /// Snapshot file is not on the same filesystem as the database.
    #[error("snapshot file is on a different filesystem: {}", path.display())]
    SnapshotCrossDevice { path: PathBuf },

    /// Reflink clone of the database into a snapshot failed.
    #[error("cannot clone database into snapshot {}: {source}", path.display())]
    SnapshotClone { path: PathBuf, source: io::Error },

    /// Recovery abandoned after exceeding a failure threshold.
    #[error("recovery aborted: {failed_keys} bad keys, {failed_buckets} bad buckets")]
    RecoveryAborted {
        failed_keys: usize,
        failed_buckets: usize,
    },

    /// Could not rename the original database to its backup name.
    #[error("cannot back up database to {}: {source}", path.display())]
    BackupFailed { path: PathBuf, source: io::Error },
}

/// The crate Result type.
pub type Result<T> = std::result::Result<T, Error>;
