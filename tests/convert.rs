//
// tests/convert.rs -- standard/extended format conversion
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

extern crate dynahash;

mod common;

use common::{kv, verify_filled, SMALL_BLOCK};
use dynahash::{BlockSize, OpenOptions};
use tempfile::tempdir;

fn create_with_numsync(path: &std::path::Path, numsync: bool) -> dynahash::Db<dynahash::ReadWrite> {
    OpenOptions::new()
        .write()
        .create()
        .newdb(true)
        .block_size(BlockSize::Exactly(SMALL_BLOCK))
        .numsync(numsync)
        .open(path)
        .unwrap()
}

#[test]
fn api_convert_preserves_content() {
    const COUNT: usize = 250;

    for to_numsync in [true, false] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("convert.db");

        let mut db = create_with_numsync(&path, !to_numsync);
        assert_eq!(db.is_numsync(), !to_numsync);

        // churn a little so the master avail pool is populated before the
        // conversion resizes it
        common::fill(&mut db, COUNT);
        (0..COUNT)
            .filter(|n| n % 4 == 0)
            .try_for_each(|n| db.remove(&kv(n).0).map(|_| ()))
            .unwrap();
        (0..COUNT)
            .filter(|n| n % 4 == 0)
            .try_for_each(|n| {
                let (key, value) = kv(n);
                db.insert(&key, &value).map(|_| ())
            })
            .unwrap();

        db.set_numsync(to_numsync).unwrap();
        db.sync().unwrap();
        assert_eq!(db.is_numsync(), to_numsync);
        verify_filled(&mut db, COUNT);
        db.close().unwrap();

        // the converted format survives a reopen with everything intact
        let mut db = OpenOptions::new().write().open(&path).unwrap();
        assert_eq!(db.is_numsync(), to_numsync);
        verify_filled(&mut db, COUNT);
        assert_eq!(db.len().unwrap(), COUNT);
        db.check_structure().unwrap();
    }
}

#[test]
fn api_convert_with_crowded_avail_pool() {
    const COUNT: usize = 500;

    let dir = tempdir().unwrap();
    let path = dir.path().join("crowded.db");

    let mut db = create_with_numsync(&path, false);
    db.set_central_free(true);

    // heavy deletion pressure fills the master pool (and chains overflow
    // blocks); upgrading then shrinks the inline pool and must re-home
    // the displaced elements without losing data
    common::fill(&mut db, COUNT);
    (0..COUNT)
        .filter(|n| n % 2 == 0)
        .try_for_each(|n| db.remove(&kv(n).0).map(|_| ()))
        .unwrap();

    db.set_numsync(true).unwrap();
    db.sync().unwrap();
    db.close().unwrap();

    let mut db = OpenOptions::new().write().open(&path).unwrap();
    assert!(db.is_numsync());
    assert_eq!(db.len().unwrap(), COUNT / 2);
    (0..COUNT).try_for_each(|n| {
        let (key, value) = kv(n);
        let got = db.fetch(&key).unwrap();
        if n % 2 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.as_deref(), Some(value.as_bytes()));
        }
        Ok::<(), dynahash::Error>(())
    })
    .unwrap();
    db.check_structure().unwrap();
}

#[test]
fn api_convert_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idem.db");

    let mut db = create_with_numsync(&path, true);
    db.insert("k", "v").unwrap();

    // converting to the format already in use is a no-op
    db.set_numsync(true).unwrap();
    db.sync().unwrap();
    assert!(db.is_numsync());
    assert_eq!(db.fetch("k").unwrap().as_deref(), Some(&b"v"[..]));
}
