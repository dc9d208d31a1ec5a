//
// tests/split.rs -- bucket splitting and directory doubling
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

extern crate dynahash;

mod common;

use common::{create_small, fill, kv, verify_filled};
use tempfile::tempdir;

// With a 512-byte block a bucket holds 16 slots.
const BUCKET_ELEMS: usize = 16;

#[test]
fn api_first_split() {
    let dir = tempdir().unwrap();
    let mut db = create_small(dir.path().join("split.db"));

    // a handful more keys than one bucket can hold forces at least one
    // split
    let count = BUCKET_ELEMS + 5;
    fill(&mut db, count);
    verify_filled(&mut db, count);
    assert_eq!(db.len().unwrap(), count);

    let report = db.check_structure().unwrap();
    assert_eq!(report.entries, count);
    assert!(report.buckets >= 2, "no split happened: {report:?}");
    assert!(report.max_bucket_bits >= 1);
    assert!(report.max_bucket_bits <= report.dir_bits);
}

#[test]
fn api_split_churn() {
    const COUNT: usize = 600;

    let dir = tempdir().unwrap();
    let mut db = create_small(dir.path().join("churn.db"));

    fill(&mut db, COUNT);
    assert_eq!(db.len().unwrap(), COUNT);
    db.check_structure().unwrap();

    // remove every other key, then make sure probing still finds the rest
    (0..COUNT)
        .filter(|n| n % 2 == 0)
        .try_for_each(|n| db.remove(&kv(n).0).map(|old| assert!(old.is_some())))
        .unwrap_or_else(|e| panic!("remove: {e}"));

    (0..COUNT)
        .try_for_each(|n| {
            let (key, value) = kv(n);
            db.fetch(&key).map(|got| {
                if n % 2 == 0 {
                    assert_eq!(got, None, "{key} should be gone");
                } else {
                    assert_eq!(got.as_deref(), Some(value.as_bytes()), "{key} lost");
                }
            })
        })
        .unwrap_or_else(|e| panic!("fetch: {e}"));

    assert_eq!(db.len().unwrap(), COUNT / 2);
    let report = db.check_structure().unwrap();
    assert_eq!(report.entries, COUNT / 2);
}

#[test]
fn api_directory_doubling() {
    // 512-byte blocks start with a 6-bit directory able to address 64
    // buckets of 16 slots; 2000 keys cannot fit without doubling it.
    const COUNT: usize = 2000;

    let dir = tempdir().unwrap();
    let mut db = create_small(dir.path().join("double.db"));

    fill(&mut db, COUNT);
    verify_filled(&mut db, COUNT);
    assert_eq!(db.len().unwrap(), COUNT);

    let report = db.check_structure().unwrap();
    assert!(
        report.dir_bits >= 7,
        "directory never doubled: {report:?}"
    );
    assert_eq!(report.entries, COUNT);

    // doubled databases survive a reopen
    db.close().unwrap();
    let mut db = dynahash::OpenOptions::new()
        .write()
        .open(dir.path().join("double.db"))
        .unwrap();
    verify_filled(&mut db, COUNT);
    db.check_structure().unwrap();
}
