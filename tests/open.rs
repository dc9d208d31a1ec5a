//
// tests/open.rs -- open modes, block sizes, locking, format checks
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

extern crate dynahash;

mod common;

use common::create_small;
use dynahash::{BlockSize, CacheSize, Error, OpenOptions};
use tempfile::{tempdir, NamedTempFile};

#[test]
// Non-empty, but invalid, DB causes creat to fail (bad format).
// Empty DB allows creat to succeed.
// Regardless of content, newdb always succeeds.
fn api_open_creat_newdb() {
    let old_db = NamedTempFile::new().expect("creating a temporary file");

    let baddb_content = b"bad DB content".to_vec();
    let empty_content = vec![];
    [
        (false, &baddb_content, Err(())),
        (false, &empty_content, Ok(())),
        (true, &baddb_content, Ok(())),
        (true, &empty_content, Ok(())),
    ]
    .into_iter()
    .try_for_each(|(newdb, content, expected)| {
        std::fs::write(old_db.path(), content).expect("creating a DB file");

        match OpenOptions::new()
            .write()
            .create()
            .newdb(newdb)
            .open(old_db.path())
        {
            Ok(_) if expected.is_ok() => Ok(()),
            Err(_) if expected.is_err() => Ok(()),
            _ => Err(format!(
                "newdb: {}, empty content: {}, expected: {:?}",
                newdb,
                content.is_empty(),
                expected
            )),
        }
    })
    .unwrap_or_else(|e: String| panic!("{}", e));
}

#[test]
fn api_open_missing_file() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.db");

    // a reader requires the file to exist
    assert!(OpenOptions::new().open(&missing).is_err());
    // so does a plain writer
    assert!(OpenOptions::new().write().open(&missing).is_err());
    // a creating writer does not
    OpenOptions::new().write().create().open(&missing).unwrap();
}

#[test]
// Test for valid block sizes.
fn api_open_bsexact() {
    let dir = tempdir().unwrap();

    [
        (256, Err(())),  // aligned, but too small
        (511, Err(())),  // not aligned and too small
        (512, Ok(())),   // minimum
        (768, Err(())),  // not aligned
        (1024, Ok(())),  // aligned
        (65536, Ok(())), // maximum
    ]
    .into_iter()
    .try_for_each(|(block_size, expected)| {
        let path = dir.path().join(format!("bs-{block_size}.db"));
        match OpenOptions::new()
            .write()
            .create()
            .newdb(true)
            .block_size(BlockSize::Exactly(block_size))
            .open(&path)
        {
            Ok(db) if expected.is_ok() => {
                assert_eq!(db.block_size(), block_size);
                Ok(())
            }
            Err(_) if expected.is_err() => Ok(()),
            Ok(_) => Err(format!("blocksize: {}, newdb opened", block_size)),
            Err(e) => Err(format!("blocksize: {}, newdb error: {}", block_size, e)),
        }
    })
    .unwrap_or_else(|e: String| panic!("bsexact unexpected: {}", e));
}

#[test]
fn api_open_block_size_roughly() {
    let dir = tempdir().unwrap();

    for (requested, expected) in [(100u32, 512u32), (600, 1024), (65536, 65536)] {
        let path = dir.path().join(format!("roughly-{requested}.db"));
        let db = OpenOptions::new()
            .write()
            .create()
            .newdb(true)
            .block_size(BlockSize::Roughly(requested))
            .open(&path)
            .unwrap();
        assert_eq!(db.block_size(), expected, "requested {requested}");
    }
}

#[test]
fn api_locking_excludes_writers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.db");

    let mut writer = create_small(&path);
    writer.sync().unwrap();

    // second writer: locked out
    assert!(matches!(
        OpenOptions::new().write().open(&path),
        Err(Error::CannotLock)
    ));
    // reader: locked out by the exclusive writer lock
    assert!(matches!(
        OpenOptions::new().open(&path),
        Err(Error::CannotLock)
    ));
    // lock bypass is the caller's risk
    OpenOptions::new().no_lock(true).open(&path).unwrap();

    drop(writer);

    // two readers share
    let reader1 = OpenOptions::new().open(&path).unwrap();
    let _reader2 = OpenOptions::new().open(&path).unwrap();
    // and exclude writers
    assert!(matches!(
        OpenOptions::new().write().open(&path),
        Err(Error::CannotLock)
    ));
    drop(reader1);
}

#[test]
fn api_byte_swapped_database_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("swapped.db");

    create_small(&path).close().unwrap();

    // reverse the stored magic word, as if the file came from an
    // opposite-endian host
    let mut content = std::fs::read(&path).unwrap();
    content[0..4].reverse();
    std::fs::write(&path, &content).unwrap();

    assert!(matches!(
        OpenOptions::new().open(&path),
        Err(Error::ByteSwapped)
    ));

    // arbitrary garbage is a different failure
    content[0..4].copy_from_slice(&[1, 2, 3, 4]);
    std::fs::write(&path, &content).unwrap();
    assert!(matches!(
        OpenOptions::new().open(&path),
        Err(Error::BadMagic { .. })
    ));
}

#[test]
fn api_truncated_database_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.db");

    let mut db = create_small(&path);
    common::fill(&mut db, 100);
    db.close().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len / 2).unwrap();
    drop(file);

    assert!(OpenOptions::new().open(&path).is_err());
}

#[test]
fn api_cache_size_options() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");

    // a tiny fixed cache still works, just evicts a lot
    let mut db = OpenOptions::new()
        .cache_size(CacheSize::Entries(8))
        .write()
        .create()
        .newdb(true)
        .block_size(BlockSize::Exactly(common::SMALL_BLOCK))
        .open(&path)
        .unwrap();
    common::fill(&mut db, 500);
    common::verify_filled(&mut db, 500);

    // the capacity policy may only be chosen once
    assert!(matches!(
        db.set_cache_size(CacheSize::Auto),
        Err(Error::OptAlreadySet)
    ));
    db.close().unwrap();

    // sentinel Entries(0) selects auto-grow
    let mut db = OpenOptions::new()
        .cache_size(CacheSize::Entries(0))
        .write()
        .open(&path)
        .unwrap();
    common::verify_filled(&mut db, 500);
}

#[test]
fn api_no_mmap_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nommap.db");

    let mut db = OpenOptions::new()
        .no_mmap(true)
        .write()
        .create()
        .newdb(true)
        .block_size(BlockSize::Exactly(common::SMALL_BLOCK))
        .open(&path)
        .unwrap();
    common::fill(&mut db, 200);
    common::verify_filled(&mut db, 200);
    db.close().unwrap();

    // a mapped reader sees what the direct writer wrote
    let mut db = OpenOptions::new().open(&path).unwrap();
    assert_eq!(db.len().unwrap(), 200);
}

#[test]
fn api_tempfile_database() {
    let mut db = OpenOptions::new()
        .write()
        .create()
        .tempfile()
        .unwrap();

    db.insert("k", "v").unwrap();
    assert_eq!(db.fetch("k").unwrap().as_deref(), Some(&b"v"[..]));
    assert_eq!(db.path(), None);

    // name-dependent operations refuse
    assert!(matches!(db.reorganize(), Err(Error::NoDbName)));
}
