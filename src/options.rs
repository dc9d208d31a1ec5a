//
// options.rs -- database open options
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::cache::CacheSize;
use crate::{Config, Db, Error, ReadOnly, ReadWrite, Result};

/// Block size policy for a new database.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Default)]
pub enum BlockSize {
    /// Use the filesystem's preferred I/O size.
    #[default]
    Filesystem,
    /// Round the requested size to something usable.
    Roughly(u32),
    /// Fail with [`Error::BadBlockSize`] unless the size is usable as-is.
    Exactly(u32),
}

#[derive(Default, Copy, Clone, Debug)]
pub struct Create {
    pub numsync: bool,
    pub newdb: bool,
    pub block_size: BlockSize,
}

#[derive(Default, Copy, Clone, Debug)]
pub struct NotCreate;

#[derive(Copy, Clone, Debug, Default)]
pub struct NotWrite;

#[derive(Copy, Clone, Debug, Default)]
pub struct Write<C> {
    pub sync: bool,
    pub create: C,
}

/// Typestate database opening builder.
///
/// The four open modes map onto builder states: a reader is the default,
/// `.write()` requires an existing database, `.write().create()` creates
/// one when absent, and `.write().create().newdb(true)` always starts
/// from an empty database.
#[derive(Copy, Clone, Debug, Default)]
pub struct OpenOptions<W> {
    /// Bucket cache capacity policy.
    pub cache_size: CacheSize,
    /// Skip the advisory file lock; the caller supplies mutual exclusion.
    pub no_lock: bool,
    /// Use direct file I/O only.
    pub no_mmap: bool,
    /// Initial mmap window size hint, in bytes.
    pub mmap_size: Option<usize>,
    /// Ceiling on the mmap window, in bytes.
    pub max_map_size: Option<usize>,
    /// Set close-on-exec on the descriptor.
    pub close_on_exec: bool,

    pub write: W,
}

impl OpenOptions<NotWrite> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W> OpenOptions<W> {
    pub fn cache_size(self, cache_size: CacheSize) -> OpenOptions<W> {
        OpenOptions { cache_size, ..self }
    }

    pub fn no_lock(self, no_lock: bool) -> OpenOptions<W> {
        OpenOptions { no_lock, ..self }
    }

    pub fn no_mmap(self, no_mmap: bool) -> OpenOptions<W> {
        OpenOptions { no_mmap, ..self }
    }

    pub fn mmap_size(self, mmap_size: Option<usize>) -> OpenOptions<W> {
        OpenOptions { mmap_size, ..self }
    }

    pub fn max_map_size(self, max_map_size: Option<usize>) -> OpenOptions<W> {
        OpenOptions {
            max_map_size,
            ..self
        }
    }

    pub fn close_on_exec(self, close_on_exec: bool) -> OpenOptions<W> {
        OpenOptions {
            close_on_exec,
            ..self
        }
    }

    pub(crate) fn config(&self) -> Config {
        Config {
            cache_size: self.cache_size,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_size: self.mmap_size,
            max_map_size: self.max_map_size,
            close_on_exec: self.close_on_exec,
        }
    }

    fn fs_options(&self, read_only: bool) -> std::fs::OpenOptions {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(!read_only);
        if self.close_on_exec {
            options.custom_flags(libc::O_CLOEXEC);
        }

        options
    }
}

impl OpenOptions<NotWrite> {
    pub fn write(self) -> OpenOptions<Write<NotCreate>> {
        OpenOptions {
            cache_size: self.cache_size,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_size: self.mmap_size,
            max_map_size: self.max_map_size,
            close_on_exec: self.close_on_exec,
            write: Write {
                sync: false,
                create: NotCreate,
            },
        }
    }

    /// Opens an existing database read-only (Reader mode). Mutating
    /// methods do not exist on the returned handle.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Db<ReadOnly>> {
        let file = self.fs_options(true).open(&path).map_err(Error::Io)?;
        Db::<ReadOnly>::open(file, Some(path.as_ref().to_path_buf()), self.config(), false)
    }
}

impl<C> OpenOptions<Write<C>> {
    /// Sync metadata to disk after every mutating operation.
    pub fn sync(self, sync: bool) -> OpenOptions<Write<C>> {
        OpenOptions {
            write: Write {
                sync,
                create: self.write.create,
            },
            ..self
        }
    }
}

impl OpenOptions<Write<NotCreate>> {
    pub fn create(self) -> OpenOptions<Write<Create>> {
        OpenOptions {
            cache_size: self.cache_size,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_size: self.mmap_size,
            max_map_size: self.max_map_size,
            close_on_exec: self.close_on_exec,
            write: Write {
                sync: self.write.sync,
                create: Create {
                    numsync: true,
                    ..Create::default()
                },
            },
        }
    }

    /// Opens an existing database read-write (Writer mode).
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Db<ReadWrite>> {
        let file = self.fs_options(false).open(&path).map_err(Error::Io)?;
        Db::<ReadWrite>::open(file, Some(path.as_ref().to_path_buf()), self.config(), true).map(
            |mut db| {
                db.set_sync(self.write.sync);
                db
            },
        )
    }
}

impl OpenOptions<Write<Create>> {
    /// Select the extended on-disk format (default true).
    pub fn numsync(self, numsync: bool) -> OpenOptions<Write<Create>> {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    numsync,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    /// Always start from an empty database, discarding any existing
    /// content (NewDb mode).
    pub fn newdb(self, newdb: bool) -> OpenOptions<Write<Create>> {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    newdb,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    pub fn block_size(self, block_size: BlockSize) -> OpenOptions<Write<Create>> {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    block_size,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    /// Opens read-write, creating the database when the file is missing
    /// or empty (WrCreate mode), or unconditionally fresh under `newdb`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Db<ReadWrite>> {
        let path_buf = path.as_ref().to_path_buf();

        let (file, fresh) = if self.write.create.newdb {
            let file = self
                .fs_options(false)
                .create(true)
                .open(&path)
                .map_err(Error::Io)?;
            (file, true)
        } else {
            match self.fs_options(false).open(&path) {
                Ok(file) => {
                    let fresh = file.metadata().map_err(Error::Io)?.len() == 0;
                    (file, fresh)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let file = self
                        .fs_options(false)
                        .create_new(true)
                        .open(&path)
                        .map_err(Error::Io)?;
                    (file, true)
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };

        let db = if fresh {
            Db::create(
                file,
                Some(path_buf),
                self.config(),
                self.write.sync,
                self.write.create.block_size,
                self.write.create.numsync,
            )
        } else {
            Db::<ReadWrite>::open(file, Some(path_buf), self.config(), true)
        };

        db.map(|mut db| {
            db.set_sync(self.write.sync);
            db
        })
    }

    /// Creates an anonymous temporary database. It is never visible in
    /// the filesystem and disappears when the handle is dropped; name
    /// dependent operations (reorganize, recover, snapshot arming) fail
    /// with [`Error::NoDbName`].
    pub fn tempfile(&self) -> Result<Db<ReadWrite>> {
        let file = tempfile::tempfile().map_err(Error::Io)?;
        Db::create(
            file,
            None,
            self.config(),
            self.write.sync,
            self.write.create.block_size,
            self.write.create.numsync,
        )
    }
}
