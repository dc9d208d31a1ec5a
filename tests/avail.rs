//
// tests/avail.rs -- free-space reuse, coalescing, central-free
//
// Copyright (c) 2024-2025 Jeff Garzik
//
// This file is part of the dynahash software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

extern crate dynahash;

mod common;

use common::{create_small, fill, kv};
use tempfile::tempdir;

fn file_len(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

// Freeing two adjacent regions and allocating their combined size must
// succeed without growing the file -- but only when coalescing is on.
#[test]
fn api_coalescing_reuses_adjacent_regions() {
    for coalesce in [true, false] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coalesce.db");

        let mut db = create_small(&path);
        db.set_central_free(true);
        db.set_coalesce_blocks(coalesce);

        // two 300-byte records, allocated back to back from fresh file
        // extensions (one 512-byte block each, remainders pooled)
        db.insert("a", vec![1u8; 299]).unwrap();
        db.insert("b", vec![2u8; 299]).unwrap();
        db.sync().unwrap();
        let len_before = file_len(&path);

        // free both records; with coalescing the remainders and records
        // merge into one contiguous 1024-byte region
        db.remove("a").unwrap();
        db.remove("b").unwrap();

        // a 1000-byte record only fits into the merged region
        db.insert("c", vec![3u8; 999]).unwrap();
        db.sync().unwrap();
        let len_after = file_len(&path);

        if coalesce {
            assert_eq!(
                len_after, len_before,
                "coalesced allocation must not extend the file"
            );
        } else {
            assert!(
                len_after > len_before,
                "fragmented pools cannot satisfy the large allocation"
            );
        }

        assert_eq!(db.fetch("c").unwrap(), Some(vec![3u8; 999]));
        db.check_structure().unwrap();
    }
}

#[test]
fn api_deleted_space_is_recycled() {
    const COUNT: usize = 400;

    let dir = tempdir().unwrap();
    let path = dir.path().join("recycle.db");

    let mut db = create_small(&path);
    fill(&mut db, COUNT);
    db.sync().unwrap();
    let high_water = file_len(&path);

    // delete-and-reinsert churn of same-sized records must level off,
    // not grow the file every round
    for _round in 0..5 {
        (0..COUNT)
            .try_for_each(|n| db.remove(&kv(n).0).map(|_| ()))
            .unwrap();
        (0..COUNT)
            .try_for_each(|n| {
                let (key, value) = kv(n);
                db.insert(&key, &value).map(|_| ())
            })
            .unwrap();
    }
    db.sync().unwrap();

    assert!(
        file_len(&path) <= high_water * 3,
        "file grew without bound: {} -> {}",
        high_water,
        file_len(&path)
    );

    let report = db.check_structure().unwrap();
    assert_eq!(report.entries, COUNT);
}

#[test]
fn api_central_free_routes_to_master_pool() {
    const COUNT: usize = 200;

    let dir = tempdir().unwrap();
    let path = dir.path().join("central.db");

    let mut db = create_small(&path);
    db.set_central_free(true);
    db.set_coalesce_blocks(true);
    assert!(db.central_free());
    assert!(db.coalesce_blocks());

    fill(&mut db, COUNT);
    (0..COUNT)
        .filter(|n| n % 3 != 0)
        .try_for_each(|n| db.remove(&kv(n).0).map(|_| ()))
        .unwrap();
    db.sync().unwrap();

    // freed space lands in the master pool and the structure stays valid,
    // including any overflow blocks chained from the header
    db.check_structure().unwrap();

    // and the space is reusable
    fill(&mut db, COUNT);
    common::verify_filled(&mut db, COUNT);
    db.check_structure().unwrap();
}
