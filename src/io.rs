//
// io.rs -- file I/O shim
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Unified positioned read/write over the database file.
//!
//! Two paths exist: plain seek + read/write on the descriptor, and a
//! shared mapping of a window `[0, window_len)` of the file. The window
//! grows geometrically up to a configurable ceiling; accesses beyond it
//! fall back to the direct path. Short reads and writes (including EINTR)
//! are retried by `read_exact`/`write_all`.
//!
//! The window may extend past end-of-file; callers never touch bytes at or
//! beyond the tracked file length, and writes extend the file with
//! `set_len` (ftruncate) first, so no access faults on a missing page.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

/// Initial mapping window when the caller gives no hint.
pub const DEFAULT_MMAP_SIZE: usize = 8 << 20;

/// Ceiling on the mapping window.
pub const DEFAULT_MAX_MAP_SIZE: usize = 1 << 30;

#[derive(Debug, Clone, Copy)]
pub struct MapConfig {
    pub enabled: bool,
    pub initial: usize,
    pub max: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            enabled: true,
            initial: DEFAULT_MMAP_SIZE,
            max: DEFAULT_MAX_MAP_SIZE,
        }
    }
}

struct MapWindow {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MapWindow {
    fn new(file: &File, len: usize, writable: bool) -> io::Result<MapWindow> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(MapWindow { ptr, len })
    }

    fn slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    fn sync(&self) -> io::Result<()> {
        match unsafe { libc::msync(self.ptr, self.len, libc::MS_SYNC) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for MapWindow {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

pub struct Dio {
    file: File,
    /// Tracked file length; the single source of truth for EOF.
    len: u64,
    writable: bool,
    map: Option<MapWindow>,
    map_enabled: bool,
    map_initial: usize,
    map_max: usize,
}

impl Dio {
    pub fn new(file: File, writable: bool, cfg: MapConfig) -> io::Result<Dio> {
        let len = file.metadata()?.len();

        let mut dio = Dio {
            file,
            len,
            writable,
            map: None,
            map_enabled: cfg.enabled,
            map_initial: cfg.initial.max(1),
            map_max: cfg.max.max(cfg.initial).max(1),
        };

        if dio.map_enabled && len > 0 {
            let want = (len as usize).max(dio.map_initial).min(dio.map_max);
            dio.remap(want);
        }

        Ok(dio)
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    // Best effort: a mapping failure permanently falls back to direct I/O.
    fn remap(&mut self, want: usize) {
        self.map = None;
        match MapWindow::new(&self.file, want, self.writable) {
            Ok(window) => self.map = Some(window),
            Err(e) => {
                log::warn!("mmap of {} bytes failed, using direct I/O: {}", want, e);
                self.map_enabled = false;
            }
        }
    }

    // Grows the window to cover `end` bytes, doubling to amortize remaps.
    fn ensure_window(&mut self, end: usize) -> bool {
        if !self.map_enabled || end > self.map_max {
            return false;
        }

        let have = self.map.as_ref().map_or(0, |w| w.len);
        if end <= have {
            return true;
        }

        let want = end
            .max(have.saturating_mul(2))
            .max(self.map_initial)
            .min(self.map_max);
        log::debug!("growing mmap window {} -> {}", have, want);
        self.remap(want);

        self.map.as_ref().map_or(false, |w| end <= w.len)
    }

    pub fn read_at(&mut self, ofs: u64, size: usize) -> io::Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let end = ofs
            .checked_add(size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read beyond u64 range"))?;

        if end <= self.len && end <= self.map_max as u64 && self.ensure_window(end as usize) {
            let window = self.map.as_ref().unwrap();
            return Ok(window.slice()[ofs as usize..end as usize].to_vec());
        }

        let mut data = vec![0u8; size];
        self.file.seek(SeekFrom::Start(ofs))?;
        self.file.read_exact(&mut data)?;

        Ok(data)
    }

    pub fn write_at(&mut self, ofs: u64, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = ofs + data.len() as u64;
        if end > self.len {
            self.file.set_len(end)?;
            self.len = end;
        }

        if end <= self.map_max as u64 && self.ensure_window(end as usize) {
            let window = self.map.as_mut().unwrap();
            window.slice_mut()[ofs as usize..end as usize].copy_from_slice(data);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(ofs))?;
        self.file.write_all(data)?;

        Ok(())
    }

    /// Extends (or shrinks) the file to exactly `new_len` bytes.
    pub fn truncate(&mut self, new_len: u64) -> io::Result<()> {
        self.file.set_len(new_len)?;
        self.len = new_len;

        Ok(())
    }

    /// Flushes mapped pages and file data to stable storage.
    pub fn sync_data(&mut self) -> io::Result<()> {
        if let Some(window) = &self.map {
            window.sync()?;
        }
        self.file.sync_data()
    }
}
