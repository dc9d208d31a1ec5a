extern crate dynahash;

use dynahash::{BlockSize, Db, OpenOptions, ReadWrite};
use std::path::Path;

/// Small block size: 16 slots per bucket, so splits happen early.
#[allow(dead_code)]
pub const SMALL_BLOCK: u32 = 512;

#[allow(dead_code)]
pub fn create_small<P: AsRef<Path>>(path: P) -> Db<ReadWrite> {
    OpenOptions::new()
        .write()
        .create()
        .newdb(true)
        .block_size(BlockSize::Exactly(SMALL_BLOCK))
        .open(path)
        .expect("creating test database")
}

#[allow(dead_code)]
pub fn kv(n: usize) -> (String, String) {
    (format!("key-{n}"), format!("value-{n}"))
}

#[allow(dead_code)]
pub fn fill(db: &mut Db<ReadWrite>, count: usize) {
    (0..count)
        .try_for_each(|n| {
            let (key, value) = kv(n);
            db.insert(&key, &value).map(|_| ())
        })
        .expect("filling test database");
}

#[allow(dead_code)]
pub fn verify_filled(db: &mut Db<ReadWrite>, count: usize) {
    (0..count)
        .try_for_each(|n| {
            let (key, value) = kv(n);
            db.fetch(&key).map(|got| {
                assert_eq!(
                    got.as_deref(),
                    Some(value.as_bytes()),
                    "wrong value for {key}"
                );
            })
        })
        .expect("verifying test database");
}
