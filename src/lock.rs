//
// lock.rs -- advisory whole-file locking
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Advisory whole-file locks: shared for readers, exclusive for writers.
//!
//! Mechanisms are tried in order -- `flock`, `lockf`, `fcntl` byte-range --
//! falling through only when a mechanism is unsupported on the filesystem.
//! A held conflicting lock yields [`Error::CannotLock`]. Locks are
//! released when the descriptor closes.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

// EWOULDBLOCK aliases EAGAIN on every supported platform
fn is_contended(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EACCES) | Some(libc::EAGAIN)
    )
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOLCK)
    )
}

fn flock_try(file: &File, kind: LockKind) -> io::Result<()> {
    let op = match kind {
        LockKind::Shared => libc::LOCK_SH,
        LockKind::Exclusive => libc::LOCK_EX,
    } | libc::LOCK_NB;

    match unsafe { libc::flock(file.as_raw_fd(), op) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

// lockf only takes write locks, so it is skipped for readers
fn lockf_try(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    unsafe {
        if libc::lseek(fd, 0, libc::SEEK_SET) < 0 {
            return Err(io::Error::last_os_error());
        }
        match libc::lockf(fd, libc::F_TLOCK, 0) {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

fn fcntl_try(file: &File, kind: LockKind) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        LockKind::Shared => libc::F_RDLCK as libc::c_short,
        LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0; // whole file

    match unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Takes the advisory lock without blocking. Contention is reported as
/// [`Error::CannotLock`]; the lock lives as long as the descriptor.
pub fn try_lock(file: &File, kind: LockKind) -> Result<()> {
    match flock_try(file, kind) {
        Ok(()) => return Ok(()),
        Err(e) if is_contended(&e) => return Err(Error::CannotLock),
        Err(e) if !is_unsupported(&e) => return Err(Error::Io(e)),
        Err(_) => (),
    }

    if kind == LockKind::Exclusive {
        match lockf_try(file) {
            Ok(()) => return Ok(()),
            Err(e) if is_contended(&e) => return Err(Error::CannotLock),
            Err(e) if !is_unsupported(&e) => return Err(Error::Io(e)),
            Err(_) => (),
        }
    }

    match fcntl_try(file, kind) {
        Ok(()) => Ok(()),
        Err(e) if is_contended(&e) => Err(Error::CannotLock),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn exclusive_excludes_exclusive() {
        let named = tempfile::NamedTempFile::new().unwrap();
        let first = OpenOptions::new()
            .read(true)
            .write(true)
            .open(named.path())
            .unwrap();
        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .open(named.path())
            .unwrap();

        try_lock(&first, LockKind::Exclusive).unwrap();
        assert!(matches!(
            try_lock(&second, LockKind::Exclusive),
            Err(Error::CannotLock)
        ));

        // dropping the holder releases the lock
        drop(first);
        try_lock(&second, LockKind::Exclusive).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let named = tempfile::NamedTempFile::new().unwrap();
        let first = OpenOptions::new().read(true).open(named.path()).unwrap();
        let second = OpenOptions::new().read(true).open(named.path()).unwrap();

        try_lock(&first, LockKind::Shared).unwrap();
        try_lock(&second, LockKind::Shared).unwrap();
    }

    #[test]
    fn shared_excludes_exclusive() {
        let named = tempfile::NamedTempFile::new().unwrap();
        let reader = OpenOptions::new().read(true).open(named.path()).unwrap();
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(named.path())
            .unwrap();

        try_lock(&reader, LockKind::Shared).unwrap();
        assert!(matches!(
            try_lock(&writer, LockKind::Exclusive),
            Err(Error::CannotLock)
        ));
    }
}
