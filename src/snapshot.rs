//
// snapshot.rs -- crash-tolerant snapshot protocol
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Crash tolerance over two alternating reflink snapshots.
//!
//! Once armed, every successful sync clones the database file over one of
//! two snapshot files on the same reflink-capable filesystem. File mode is
//! the commit flag: `0200` (write-only) marks a snapshot that must not be
//! recovered from, `0400` (read-only) marks a durable copy. The two files
//! alternate, so at every instant at least one of them holds a complete
//! previously-committed database image.
//!
//! After a crash, [`latest_snapshot`] inspects the pair and picks the
//! snapshot to recover from, preferring the extended header's numsync
//! counter and falling back to mtime.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::header::peek_numsync;
use crate::{Db, Error, ReadWrite, Result, WriteState};

/// Outcome of post-crash snapshot selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotPick {
    /// Exactly one usable snapshot, or a numsync winner.
    Chosen(PathBuf),
    /// Both snapshots claim durability but their counters disagree in an
    /// unexpected way; the more recently modified one is offered.
    Suspicious(PathBuf),
    /// Both snapshots are equally plausible; manual inspection required.
    Same,
    /// Neither snapshot is usable (the crash interrupted arming).
    Bad,
}

#[cfg(target_os = "linux")]
fn reflink_clone(dst: &File, src: &File) -> io::Result<()> {
    match unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONE as _, src.as_raw_fd()) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(not(target_os = "linux"))]
fn reflink_clone(_dst: &File, _src: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "reflink clone is not supported on this platform",
    ))
}

fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    File::open(parent)?.sync_all()
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// The armed snapshot pair. `current` indexes the file the next sync will
/// overwrite.
#[derive(Debug)]
pub(crate) struct SnapshotSet {
    files: [PathBuf; 2],
    current: usize,
}

impl SnapshotSet {
    pub(crate) fn arm(db_path: &Path, db_file: &File, even: &Path, odd: &Path) -> Result<SnapshotSet> {
        let db_dev = db_file.metadata().map_err(Error::Io)?.dev();

        let mut created: Vec<&Path> = Vec::new();
        let armed = (|| -> Result<()> {
            for path in [even, odd] {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o200)
                    .open(path)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::AlreadyExists => Error::SnapshotExists {
                            path: path.to_path_buf(),
                        },
                        _ => Error::Io(e),
                    })?;
                created.push(path);

                if file.metadata().map_err(Error::Io)?.dev() != db_dev {
                    return Err(Error::SnapshotCrossDevice {
                        path: path.to_path_buf(),
                    });
                }
                file.sync_all().map_err(Error::Io)?;
            }

            // make all three directory entries durable before the first
            // sync starts producing snapshots
            for path in [even, odd, db_path] {
                fsync_parent_dir(path).map_err(Error::Io)?;
            }

            Ok(())
        })();

        if let Err(e) = armed {
            for path in created {
                let _ = fs::remove_file(path);
            }
            return Err(e);
        }

        Ok(SnapshotSet {
            files: [even.to_path_buf(), odd.to_path_buf()],
            current: 0,
        })
    }

    /// Executes one snapshot step after a successful data sync:
    /// demote-current, clone, commit-current, demote-previous, toggle.
    pub(crate) fn advance(&mut self, db_file: &File) -> Result<()> {
        let cur = self.files[self.current].clone();
        let prev = self.files[1 - self.current].clone();

        // mark "in progress": a crash from here on must not recover from cur
        set_mode(&cur, 0o200).map_err(Error::Io)?;
        let dst = fs::OpenOptions::new()
            .write(true)
            .open(&cur)
            .map_err(Error::Io)?;
        dst.sync_all().map_err(Error::Io)?;

        reflink_clone(&dst, db_file).map_err(|e| Error::SnapshotClone {
            path: cur.clone(),
            source: e,
        })?;
        dst.sync_all().map_err(Error::Io)?;

        // commit: cur now holds a durable image
        set_mode(&cur, 0o400).map_err(Error::Io)?;
        dst.sync_all().map_err(Error::Io)?;

        // demote the older snapshot
        set_mode(&prev, 0o200).map_err(Error::Io)?;
        fs::OpenOptions::new()
            .write(true)
            .open(&prev)
            .and_then(|f| f.sync_all())
            .map_err(Error::Io)?;

        self.current = 1 - self.current;
        log::debug!("snapshot committed to {}", cur.display());

        Ok(())
    }
}

struct SnapshotState {
    readable: bool,
    mtime: SystemTime,
    numsync: Option<u32>,
}

fn snapshot_state(path: &Path) -> Result<SnapshotState> {
    // a missing file is "not recoverable from", same as mode 0200: the
    // crash may have happened before arming finished creating it
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(SnapshotState {
                readable: false,
                mtime: SystemTime::UNIX_EPOCH,
                numsync: None,
            })
        }
        Err(e) => return Err(Error::Io(e)),
    };
    let readable = metadata.permissions().mode() & 0o400 != 0;
    let mtime = metadata.modified().map_err(Error::Io)?;

    // the numsync counter is only reachable inside a readable snapshot;
    // a malformed header simply leaves it unknown
    let numsync = if readable {
        File::open(path)
            .ok()
            .and_then(|mut f| peek_numsync(&mut f).ok())
            .flatten()
    } else {
        None
    };

    Ok(SnapshotState {
        readable,
        mtime,
        numsync,
    })
}

/// Post-crash snapshot selection.
///
/// Readability (`0400`) is the durability-committed signal. With both
/// snapshots readable the numsync counters decide: the one exactly one
/// ahead (mod 2^32) is newer. Anything else is suspicious and falls back
/// to mtime.
pub fn latest_snapshot<P: AsRef<Path>>(even: P, odd: P) -> Result<SnapshotPick> {
    let even = even.as_ref();
    let odd = odd.as_ref();
    let e = snapshot_state(even)?;
    let o = snapshot_state(odd)?;

    Ok(match (e.readable, o.readable) {
        (false, false) => SnapshotPick::Bad,
        (true, false) => SnapshotPick::Chosen(even.to_path_buf()),
        (false, true) => SnapshotPick::Chosen(odd.to_path_buf()),
        (true, true) => match (e.numsync, o.numsync) {
            (Some(a), Some(b)) if a.wrapping_sub(b) == 1 => {
                SnapshotPick::Chosen(even.to_path_buf())
            }
            (Some(a), Some(b)) if b.wrapping_sub(a) == 1 => {
                SnapshotPick::Chosen(odd.to_path_buf())
            }
            _ => match (e.mtime, o.mtime) {
                (em, om) if em > om => SnapshotPick::Suspicious(even.to_path_buf()),
                (em, om) if em < om => SnapshotPick::Suspicious(odd.to_path_buf()),
                _ => SnapshotPick::Same,
            },
        },
    })
}

impl Db<ReadWrite> {
    /// Arms crash-tolerant snapshots over the `(even, odd)` file pair.
    ///
    /// Both files must not exist yet and must live on the same
    /// reflink-capable filesystem as the database. Re-arming an already
    /// armed handle replaces the pair; the old snapshot files are left on
    /// disk untouched.
    pub fn failure_atomic<P: AsRef<Path>>(&mut self, even: P, odd: P) -> Result<()> {
        if self.read_write.state == WriteState::Inconsistent {
            return Err(Error::NeedsRecovery);
        }

        let db_path = self.path.clone().ok_or(Error::NoDbName)?;
        let set = SnapshotSet::arm(&db_path, self.dio.file(), even.as_ref(), odd.as_ref())?;

        if self.snapshots.is_some() {
            log::info!("re-arming snapshots for {}", db_path.display());
        }
        self.snapshots = Some(set);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Selection logic is covered end-to-end in tests/snapshot.rs; the
    // cases here pin the mode-bit interpretation without needing reflink
    // support in the test environment.

    #[test]
    fn selection_with_neither_readable_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let even = dir.path().join("even.snap");
        let odd = dir.path().join("odd.snap");

        for p in [&even, &odd] {
            fs::write(p, b"").unwrap();
            set_mode(p, 0o200).unwrap();
        }

        assert_eq!(latest_snapshot(&even, &odd).unwrap(), SnapshotPick::Bad);
    }

    #[test]
    fn selection_prefers_the_single_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let even = dir.path().join("even.snap");
        let odd = dir.path().join("odd.snap");

        fs::write(&even, b"").unwrap();
        fs::write(&odd, b"").unwrap();
        set_mode(&even, 0o400).unwrap();
        set_mode(&odd, 0o200).unwrap();

        assert_eq!(
            latest_snapshot(&even, &odd).unwrap(),
            SnapshotPick::Chosen(even.clone())
        );
    }

    #[test]
    fn arming_rejects_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        fs::write(&db, b"").unwrap();
        let db_file = File::open(&db).unwrap();

        let even = dir.path().join("even.snap");
        let odd = dir.path().join("odd.snap");
        fs::write(&even, b"stale").unwrap();

        let err = SnapshotSet::arm(&db, &db_file, &even, &odd).unwrap_err();
        assert!(matches!(err, Error::SnapshotExists { .. }));
        // the other file must not be left behind
        assert!(!odd.exists());
    }
}
