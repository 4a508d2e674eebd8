// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! An in-memory bucket engine. It implements the full engine interface with a
//! hashmap behind a mutex: cas and seqno generation, expiry, lock-with-
//! timeout, a failover log, a collections manifest, and a DCP producer which
//! backfills a snapshot of the bucket per stream request. It never returns
//! `WouldBlock`, which makes it the simple path for the daemon and leaves the
//! suspension machinery to engines that actually go to disk.

#[macro_use]
extern crate log;

#[macro_use]
extern crate metrics;

mod dcp;
mod kv;

pub use dcp::DcpConnState;

use bytes::Bytes;
use engine::{FailoverEntry, Item};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

counter!(ITEM_GET, "item lookups");
counter!(ITEM_GET_MISS, "item lookups which missed");
counter!(ITEM_STORE, "item stores");
counter!(ITEM_REMOVE, "item removals");
counter!(ITEM_EXPIRE, "items removed due to expiration");

/// Expiry values up to this many seconds are treated as relative offsets,
/// larger values as absolute unix timestamps.
const RELATIVE_EXPIRY_CEILING: u32 = 60 * 60 * 24 * 30;

/// Default lock duration when the client passes zero.
const DEFAULT_LOCK_SECONDS: u32 = 15;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Normalise a wire expiry into an absolute unix timestamp (0 = never).
pub(crate) fn absolute_expiry(expiry: u32) -> u32 {
    if expiry == 0 || expiry > RELATIVE_EXPIRY_CEILING {
        expiry
    } else {
        unix_now() as u32 + expiry
    }
}

struct Stored {
    item: Item,
    locked_until: u64,
}

impl Stored {
    fn is_expired(&self, now: u64) -> bool {
        self.item.expiry != 0 && u64::from(self.item.expiry) <= now
    }

    fn is_locked(&self, now: u64) -> bool {
        self.locked_until > now
    }
}

struct Manifest {
    uid: u64,
    raw: Bytes,
    ids: HashMap<String, u32>,
}

impl Default for Manifest {
    fn default() -> Self {
        let raw = Bytes::from_static(
            br#"{"uid":"0","scopes":[{"name":"_default","uid":"0","collections":[{"name":"_default","uid":"0"}]}]}"#,
        );
        let mut ids = HashMap::new();
        ids.insert("_default._default".to_string(), 0);
        Self { uid: 0, raw, ids }
    }
}

/// The in-memory bucket.
pub struct MemoryBucket {
    name: String,
    data: Mutex<HashMap<Vec<u8>, Stored>>,
    seqno: AtomicU64,
    cas: AtomicU64,
    uuid: u64,
    failover: Mutex<Vec<FailoverEntry>>,
    manifest: Mutex<Manifest>,
    vbucket_state: AtomicU64,
}

impl MemoryBucket {
    pub fn new<T: Into<String>>(name: T) -> Self {
        let uuid = unix_now() << 16 | u64::from(std::process::id() as u16);
        Self {
            name: name.into(),
            data: Mutex::new(HashMap::new()),
            seqno: AtomicU64::new(0),
            cas: AtomicU64::new(0),
            uuid,
            failover: Mutex::new(vec![FailoverEntry { uuid, seqno: 0 }]),
            manifest: Mutex::new(Manifest::default()),
            vbucket_state: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub(crate) fn next_cas(&self) -> u64 {
        self.cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_seqno(&self) -> u64 {
        self.seqno.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn high_seqno(&self) -> u64 {
        self.seqno.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{EngineCookie, EngineError, IoNotify, KvEngine, StoreSemantics};
    use std::sync::Arc;

    struct NullNotify;

    impl IoNotify for NullNotify {
        fn notify_io_complete(&self, _token: usize, _status: engine::EngineResult<()>) {}
    }

    fn cookie() -> EngineCookie {
        EngineCookie::new(0, Arc::new(NullNotify))
    }

    fn item(value: &'static [u8]) -> Item {
        Item::new(Bytes::from_static(value), 0, 0, 0)
    }

    #[test]
    fn set_then_get() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        let result = bucket
            .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Set)
            .unwrap();
        assert_ne!(result.cas, 0);
        assert_eq!(result.seqno, 1);

        let fetched = bucket.get(&c, b"k", 0).unwrap();
        assert_eq!(&fetched.value[..], b"v");
        assert_eq!(fetched.cas, result.cas);
    }

    #[test]
    fn get_miss() {
        let bucket = MemoryBucket::new("default");
        assert_eq!(
            bucket.get(&cookie(), b"missing", 0),
            Err(EngineError::KeyNotFound)
        );
    }

    #[test]
    fn add_and_replace_preconditions() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        assert_eq!(
            bucket
                .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Replace)
                .err(),
            Some(EngineError::KeyNotFound)
        );

        bucket
            .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Add)
            .unwrap();

        assert_eq!(
            bucket
                .store(&c, b"k", 0, item(b"v2"), 0, StoreSemantics::Add)
                .err(),
            Some(EngineError::KeyExists)
        );

        bucket
            .store(&c, b"k", 0, item(b"v2"), 0, StoreSemantics::Replace)
            .unwrap();
        assert_eq!(&bucket.get(&c, b"k", 0).unwrap().value[..], b"v2");
    }

    #[test]
    fn cas_mismatch() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        let cas = bucket
            .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Set)
            .unwrap()
            .cas;

        assert_eq!(
            bucket
                .store(&c, b"k", 0, item(b"v2"), cas + 1, StoreSemantics::Set)
                .err(),
            Some(EngineError::KeyExists)
        );
        assert!(bucket
            .store(&c, b"k", 0, item(b"v2"), cas, StoreSemantics::Set)
            .is_ok());
    }

    #[test]
    fn append_prepend() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        bucket
            .store(&c, b"k", 0, item(b"bb"), 0, StoreSemantics::Set)
            .unwrap();
        bucket
            .store(&c, b"k", 0, item(b"cc"), 0, StoreSemantics::Append)
            .unwrap();
        bucket
            .store(&c, b"k", 0, item(b"aa"), 0, StoreSemantics::Prepend)
            .unwrap();
        assert_eq!(&bucket.get(&c, b"k", 0).unwrap().value[..], b"aabbcc");
    }

    #[test]
    fn arithmetic() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        // create with initial value
        let (value, _) = bucket
            .arithmetic(&c, b"n", 0, 1, 10, true, true, 0)
            .unwrap();
        assert_eq!(value, 10);

        let (value, _) = bucket
            .arithmetic(&c, b"n", 0, 5, 0, false, true, 0)
            .unwrap();
        assert_eq!(value, 15);

        // decrement saturates at zero
        let (value, _) = bucket
            .arithmetic(&c, b"n", 0, 100, 0, false, false, 0)
            .unwrap();
        assert_eq!(value, 0);

        bucket
            .store(&c, b"s", 0, item(b"abc"), 0, StoreSemantics::Set)
            .unwrap();
        assert_eq!(
            bucket.arithmetic(&c, b"s", 0, 1, 0, false, true, 0),
            Err(EngineError::DeltaBadval)
        );
    }

    #[test]
    fn locking() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        bucket
            .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Set)
            .unwrap();

        let locked = bucket.get_locked(&c, b"k", 0, 15).unwrap();
        assert_eq!(
            bucket
                .store(&c, b"k", 0, item(b"v2"), 0, StoreSemantics::Set)
                .err(),
            Some(EngineError::Locked)
        );
        assert_eq!(
            bucket.get_locked(&c, b"k", 0, 15),
            Err(EngineError::TemporaryFailure)
        );

        bucket.unlock(&c, b"k", 0, locked.cas).unwrap();
        assert!(bucket
            .store(&c, b"k", 0, item(b"v2"), 0, StoreSemantics::Set)
            .is_ok());
    }

    #[test]
    fn remove_and_flush() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        bucket
            .store(&c, b"k", 0, item(b"v"), 0, StoreSemantics::Set)
            .unwrap();
        bucket.remove(&c, b"k", 0, 0).unwrap();
        assert_eq!(bucket.get(&c, b"k", 0), Err(EngineError::KeyNotFound));
        assert_eq!(
            bucket.remove(&c, b"k", 0, 0).err(),
            Some(EngineError::KeyNotFound)
        );

        bucket
            .store(&c, b"a", 0, item(b"1"), 0, StoreSemantics::Set)
            .unwrap();
        bucket.flush(&c).unwrap();
        assert_eq!(bucket.get(&c, b"a", 0), Err(EngineError::KeyNotFound));
    }

    #[test]
    fn collections_manifest() {
        let bucket = MemoryBucket::new("default");
        let c = cookie();

        assert_eq!(bucket.get_collection_id(&c, "_default._default").unwrap().1, 0);

        let manifest = br#"{"uid":"2","scopes":[{"name":"app","uid":"8","collections":[{"name":"users","uid":"9"}]}]}"#;
        bucket.set_collections_manifest(&c, manifest).unwrap();

        let (uid, cid) = bucket.get_collection_id(&c, "app.users").unwrap();
        assert_eq!(uid, 2);
        assert_eq!(cid, 9);

        assert_eq!(
            bucket.get_collection_id(&c, "app.missing"),
            Err(EngineError::UnknownCollection)
        );
    }
}
