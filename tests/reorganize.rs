//
// tests/reorganize.rs -- compaction into a fresh database
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
use dynahash::OpenOptions;
use tempfile::tempdir;

#[test]
fn api_reorganize_shrinks_and_preserves() {
    const COUNT: usize = 500;
    const KEEP: usize = 50;

    let dir = tempdir().unwrap();
    let path = dir.path().join("reorg.db");

    let mut db = create_small(&path);
    fill(&mut db, COUNT);
    (KEEP..COUNT)
        .try_for_each(|n| db.remove(&kv(n).0).map(|old| assert!(old.is_some())))
        .unwrap();
    db.sync().unwrap();

    let bloated = std::fs::metadata(&path).unwrap().len();

    db.reorganize().unwrap();

    let compacted = std::fs::metadata(&path).unwrap().len();
    assert!(
        compacted < bloated,
        "reorganize did not shrink: {bloated} -> {compacted}"
    );

    // contents, format and geometry survive
    assert!(db.is_numsync());
    assert_eq!(db.block_size(), common::SMALL_BLOCK);
    assert_eq!(db.len().unwrap(), KEEP);
    common::verify_filled(&mut db, KEEP);
    (KEEP..COUNT).for_each(|n| {
        assert_eq!(db.fetch(&kv(n).0).unwrap(), None);
    });
    db.check_structure().unwrap();

    // the handle stays usable for further writes
    db.insert("after-reorg", "ok").unwrap();
    db.sync().unwrap();
    db.close().unwrap();

    let mut db = OpenOptions::new().open(&path).unwrap();
    assert_eq!(
        db.fetch("after-reorg").unwrap().as_deref(),
        Some(&b"ok"[..])
    );
    assert_eq!(db.len().unwrap(), KEEP + 1);
}

#[test]
fn api_reorganize_empty_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.db");

    let mut db = create_small(&path);
    db.sync().unwrap();
    db.reorganize().unwrap();

    assert_eq!(db.len().unwrap(), 0);
    db.insert("k", "v").unwrap();
    assert_eq!(db.fetch("k").unwrap().as_deref(), Some(&b"v"[..]));
}
