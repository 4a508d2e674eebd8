// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end tests driving a live daemon over real sockets.

mod common;

use common::Client;

use config::SkuaConfig;
use engine::{
    DcpEngine, DcpMessageProducers, EngineCookie, EngineError, EngineResult, EngineStorage,
    FailoverEntry, Item, KvEngine, MutationResult, ObserveState, RawResponse, StoreSemantics,
    StreamRequest,
};
use entrystore::MemoryBucket;
use server::{BucketRegistry, Process, ProcessBuilder};

use bytes::Bytes;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OP_GET: u8 = 0x00;
const OP_SET: u8 = 0x01;
const OP_DELETE: u8 = 0x04;
const OP_INCREMENT: u8 = 0x05;
const OP_QUIT: u8 = 0x07;
const OP_NOOP: u8 = 0x0a;
const OP_STAT: u8 = 0x10;
const OP_HELLO: u8 = 0x1f;
const OP_SELECT_BUCKET: u8 = 0x89;
const OP_DCP_OPEN: u8 = 0x50;
const OP_DCP_STREAM_REQ: u8 = 0x53;
const OP_DCP_STREAM_END: u8 = 0x55;
const OP_DCP_SNAPSHOT_MARKER: u8 = 0x56;
const OP_DCP_MUTATION: u8 = 0x57;

const STATUS_SUCCESS: u16 = 0x0000;
const STATUS_KEY_ENOENT: u16 = 0x0001;

fn launch(buckets: BucketRegistry) -> (Process, SocketAddr) {
    let config: SkuaConfig = toml::from_str(
        "[server]\nhost = \"127.0.0.1\"\nport = \"0\"\n[worker]\nthreads = 2\n",
    )
    .expect("failed to parse test config");

    let builder = ProcessBuilder::new(&config, buckets).expect("failed to build process");
    let addr = builder.local_addr().expect("no listener address");
    (builder.spawn(), addr)
}

fn launch_default() -> (Process, SocketAddr) {
    let buckets = BucketRegistry::new();
    buckets.insert("default", Arc::new(MemoryBucket::new("default")));
    launch(buckets)
}

fn set_extras() -> [u8; 8] {
    // flags = 0, expiry = 0
    [0; 8]
}

#[test]
fn noop_round_trip() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.send_raw(&[
        0x80, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34,
        0x56, 0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]);

    let response = client.recv();
    assert_eq!(response.magic, 0x81);
    assert_eq!(response.opcode, OP_NOOP);
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(response.opaque, 0x12345678);
    assert_eq!(response.cas, 0);
    assert!(response.extras.is_empty());
    assert!(response.key.is_empty());
    assert!(response.value.is_empty());

    process.shutdown();
}

#[test]
fn get_missing_key() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    // without XERROR the miss carries no body
    client.request(OP_GET, 0, 1, 0, &[], b"x", &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_KEY_ENOENT);
    assert!(response.value.is_empty());

    // with XERROR negotiated, the miss carries a JSON error object
    let mut client = Client::connect(addr);
    client.request(OP_HELLO, 0, 2, 0, &[], b"tests", &0x0007u16.to_be_bytes());
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);

    client.request(OP_GET, 0, 3, 0, &[], b"x", &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_KEY_ENOENT);
    let body: serde_json::Value =
        serde_json::from_slice(&response.value).expect("error body must be JSON");
    assert!(body["error"]["context"].is_string());

    process.shutdown();
}

#[test]
fn set_then_get() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.request(OP_SET, 0, 10, 0, &set_extras(), b"k", b"v");
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_ne!(response.cas, 0);
    assert!(response.value.is_empty());
    let cas = response.cas;

    client.request(OP_GET, 0, 11, 0, &[], b"k", &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(response.extras, vec![0, 0, 0, 0]);
    assert_eq!(response.value, b"v");
    assert_eq!(response.cas, cas);

    process.shutdown();
}

#[test]
fn delete_and_arithmetic() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.request(OP_SET, 0, 1, 0, &set_extras(), b"k", b"v");
    assert_eq!(client.recv().status(), STATUS_SUCCESS);

    client.request(OP_DELETE, 0, 2, 0, &[], b"k", &[]);
    assert_eq!(client.recv().status(), STATUS_SUCCESS);

    client.request(OP_GET, 0, 3, 0, &[], b"k", &[]);
    assert_eq!(client.recv().status(), STATUS_KEY_ENOENT);

    // increment with create: delta 1, initial 41
    let mut extras = Vec::new();
    extras.extend_from_slice(&1u64.to_be_bytes());
    extras.extend_from_slice(&41u64.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    client.request(OP_INCREMENT, 0, 4, 0, &extras, b"counter", &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(response.value, 41u64.to_be_bytes());

    client.request(OP_INCREMENT, 0, 5, 0, &extras, b"counter", &[]);
    let response = client.recv();
    assert_eq!(response.value, 42u64.to_be_bytes());

    process.shutdown();
}

#[test]
// the header arrives in two pieces; the machine walks waiting ->
// read_packet_header -> waiting -> read_packet_header -> parse -> execute
fn split_header_delivery() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    let frame = [
        0x80, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad,
        0xbe, 0xef, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    client.send_raw(&frame[..10]);
    std::thread::sleep(Duration::from_millis(50));
    client.send_raw(&frame[10..]);

    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(response.opaque, 0xdeadbeef);

    process.shutdown();
}

#[test]
// a pipelined burst larger than the per-event budget still produces
// responses with opaques in request order
fn pipelined_opaques_in_order() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    let mut burst = Vec::new();
    for opaque in 0u32..50 {
        let mut frame = vec![
            0x80, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        frame.extend_from_slice(&opaque.to_be_bytes());
        frame.extend_from_slice(&[0; 8]);
        burst.extend_from_slice(&frame);
    }
    client.send_raw(&burst);

    for opaque in 0u32..50 {
        let response = client.recv();
        assert_eq!(response.status(), STATUS_SUCCESS);
        assert_eq!(response.opaque, opaque);
    }

    process.shutdown();
}

#[test]
// HELLO echoes the supported subset in request order
fn hello_negotiation() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    // snappy, xattr, tracing, plus an id the server does not know
    let mut features = Vec::new();
    for id in [0x000au16, 0x0006, 0x000f, 0x4242] {
        features.extend_from_slice(&id.to_be_bytes());
    }
    client.request(OP_HELLO, 0, 7, 0, &[], b"test-agent", &features);

    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(
        response.value,
        vec![0x00, 0x0a, 0x00, 0x06, 0x00, 0x0f],
        "server must echo the supported subset in order"
    );

    process.shutdown();
}

#[test]
fn quit_closes_connection() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.request(OP_QUIT, 0, 9, 0, &[], &[], &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert!(client.eof());

    process.shutdown();
}

#[test]
fn stat_stream_ends_with_empty_packet() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.request(OP_STAT, 0, 1, 0, &[], &[], &[]);

    let mut pairs = 0;
    loop {
        let response = client.recv();
        assert_eq!(response.status(), STATUS_SUCCESS);
        if response.key.is_empty() {
            break;
        }
        pairs += 1;
    }
    assert!(pairs > 0, "stat must return at least one pair");

    process.shutdown();
}

#[test]
fn select_unknown_bucket() {
    let (process, addr) = launch_default();
    let mut client = Client::connect(addr);

    client.request(OP_SELECT_BUCKET, 0, 1, 0, &[], b"nope", &[]);
    assert_eq!(client.recv().status(), STATUS_KEY_ENOENT);

    client.request(OP_SELECT_BUCKET, 0, 2, 0, &[], b"default", &[]);
    assert_eq!(client.recv().status(), STATUS_SUCCESS);

    process.shutdown();
}

#[test]
// a producer feed ships a snapshot marker, the mutations in seqno order,
// and a stream end, all as request frames
fn dcp_backfill_stream() {
    let (process, addr) = launch_default();

    // seed the bucket over a plain connection
    let mut seeder = Client::connect(addr);
    for key in [&b"a"[..], b"b", b"c"] {
        seeder.request(OP_SET, 0, 1, 0, &set_extras(), key, b"v");
        assert_eq!(seeder.recv().status(), STATUS_SUCCESS);
    }

    let mut feed = Client::connect(addr);

    // open a producer feed
    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes()); // seqno
    extras.extend_from_slice(&1u32.to_be_bytes()); // flags: producer
    feed.request(OP_DCP_OPEN, 0, 0x10, 0, &extras, b"replica", &[]);
    assert_eq!(feed.recv().status(), STATUS_SUCCESS);

    // request a bounded stream over everything
    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes()); // flags
    extras.extend_from_slice(&0u32.to_be_bytes()); // reserved
    extras.extend_from_slice(&0u64.to_be_bytes()); // start
    extras.extend_from_slice(&(u64::MAX - 1).to_be_bytes()); // end
    extras.extend_from_slice(&0u64.to_be_bytes()); // vbucket uuid
    extras.extend_from_slice(&0u64.to_be_bytes()); // snap start
    extras.extend_from_slice(&0u64.to_be_bytes()); // snap end
    feed.request(OP_DCP_STREAM_REQ, 0, 0x11, 0, &extras, &[], &[]);

    let response = feed.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert!(!response.value.is_empty());
    assert_eq!(response.value.len() % 16, 0, "failover log entries");

    // the outbound messages are client-request frames
    let marker = feed.recv();
    assert_eq!(marker.magic, 0x80);
    assert_eq!(marker.opcode, OP_DCP_SNAPSHOT_MARKER);
    assert_eq!(marker.opaque, 0x11);
    assert_eq!(marker.extras.len(), 20);

    let mut keys = Vec::new();
    for _ in 0..3 {
        let mutation = feed.recv();
        assert_eq!(mutation.magic, 0x80);
        assert_eq!(mutation.opcode, OP_DCP_MUTATION);
        assert_eq!(mutation.opaque, 0x11);
        assert_eq!(mutation.value, b"v");
        keys.push(mutation.key.clone());
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let end = feed.recv();
    assert_eq!(end.opcode, OP_DCP_STREAM_END);
    assert_eq!(end.opaque, 0x11);

    process.shutdown();
}

/// Wraps the memory bucket and forces the next `get` to take the
/// would-block path, completing from another thread a little later.
struct BlockingEngine {
    inner: MemoryBucket,
    arm: AtomicBool,
}

impl BlockingEngine {
    fn new() -> Self {
        Self {
            inner: MemoryBucket::new("default"),
            arm: AtomicBool::new(false),
        }
    }
}

impl KvEngine for BlockingEngine {
    fn get(&self, cookie: &EngineCookie, key: &[u8], vbucket: u16) -> EngineResult<Item> {
        if self.arm.swap(false, Ordering::SeqCst) {
            let cookie = cookie.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                cookie.notify(Ok(()));
            });
            return Err(EngineError::WouldBlock);
        }
        self.inner.get(cookie, key, vbucket)
    }

    fn get_if(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        filter: &mut dyn FnMut(&Item) -> bool,
    ) -> EngineResult<Option<Item>> {
        self.inner.get_if(cookie, key, vbucket, filter)
    }

    fn get_and_touch(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        expiry: u32,
    ) -> EngineResult<Item> {
        self.inner.get_and_touch(cookie, key, vbucket, expiry)
    }

    fn get_locked(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<Item> {
        self.inner.get_locked(cookie, key, vbucket, lock_timeout)
    }

    fn unlock(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<()> {
        self.inner.unlock(cookie, key, vbucket, cas)
    }

    fn store(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
    ) -> EngineResult<MutationResult> {
        self.inner.store(cookie, key, vbucket, item, cas, semantics)
    }

    fn store_if(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
        predicate: &mut dyn FnMut(Option<&Item>) -> bool,
    ) -> EngineResult<MutationResult> {
        self.inner
            .store_if(cookie, key, vbucket, item, cas, semantics, predicate)
    }

    fn remove(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationResult> {
        self.inner.remove(cookie, key, vbucket, cas)
    }

    fn arithmetic(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        delta: u64,
        initial: u64,
        create: bool,
        increment: bool,
        expiry: u32,
    ) -> EngineResult<(u64, MutationResult)> {
        self.inner
            .arithmetic(cookie, key, vbucket, delta, initial, create, increment, expiry)
    }

    fn flush(&self, cookie: &EngineCookie) -> EngineResult<()> {
        self.inner.flush(cookie)
    }

    fn stats(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        visitor: &mut dyn FnMut(&str, &str),
    ) -> EngineResult<()> {
        self.inner.stats(cookie, key, visitor)
    }

    fn reset_stats(&self, cookie: &EngineCookie) -> EngineResult<()> {
        self.inner.reset_stats(cookie)
    }

    fn observe_seqno(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
        uuid: u64,
    ) -> EngineResult<ObserveState> {
        self.inner.observe_seqno(cookie, vbucket, uuid)
    }

    fn seqno_persistence(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
        seqno: u64,
    ) -> EngineResult<()> {
        self.inner.seqno_persistence(cookie, vbucket, seqno)
    }

    fn get_failover_log(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>> {
        self.inner.get_failover_log(cookie, vbucket)
    }

    fn set_collections_manifest(
        &self,
        cookie: &EngineCookie,
        json: &[u8],
    ) -> EngineResult<()> {
        self.inner.set_collections_manifest(cookie, json)
    }

    fn get_collections_manifest(&self, cookie: &EngineCookie) -> EngineResult<Bytes> {
        self.inner.get_collections_manifest(cookie)
    }

    fn get_collection_id(
        &self,
        cookie: &EngineCookie,
        path: &str,
    ) -> EngineResult<(u64, u32)> {
        self.inner.get_collection_id(cookie, path)
    }

    fn unknown_command(
        &self,
        cookie: &EngineCookie,
        packet: &[u8],
    ) -> EngineResult<RawResponse> {
        self.inner.unknown_command(cookie, packet)
    }

    fn on_disconnect(&self, cookie: &EngineCookie) {
        self.inner.on_disconnect(cookie)
    }
}

impl DcpEngine for BlockingEngine {
    fn dcp_open(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        seqno: u32,
        flags: u32,
        name: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner.dcp_open(cookie, opaque, seqno, flags, name, storage)
    }

    fn dcp_add_stream(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner.dcp_add_stream(cookie, opaque, vbucket, flags, storage)
    }

    fn dcp_close_stream(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner.dcp_close_stream(cookie, opaque, vbucket, storage)
    }

    fn dcp_stream_req(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        request: StreamRequest,
        storage: &mut EngineStorage,
    ) -> EngineResult<Vec<FailoverEntry>> {
        self.inner
            .dcp_stream_req(cookie, opaque, vbucket, request, storage)
    }

    fn dcp_get_failover_log(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>> {
        self.inner.dcp_get_failover_log(cookie, opaque, vbucket)
    }

    fn dcp_stream_end(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_stream_end(cookie, opaque, vbucket, flags, storage)
    }

    fn dcp_snapshot_marker(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner.dcp_snapshot_marker(
            cookie, opaque, vbucket, start_seqno, end_seqno, flags, storage,
        )
    }

    fn dcp_mutation(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        item: Item,
        by_seqno: u64,
        rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_mutation(cookie, opaque, vbucket, key, item, by_seqno, rev_seqno, storage)
    }

    fn dcp_deletion(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_deletion(cookie, opaque, vbucket, key, cas, by_seqno, rev_seqno, storage)
    }

    fn dcp_expiration(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_expiration(cookie, opaque, vbucket, key, cas, by_seqno, rev_seqno, storage)
    }

    fn dcp_flush(&self, cookie: &EngineCookie, opaque: u32, vbucket: u16) -> EngineResult<()> {
        self.inner.dcp_flush(cookie, opaque, vbucket)
    }

    fn dcp_set_vbucket_state(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        state: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_set_vbucket_state(cookie, opaque, vbucket, state, storage)
    }

    fn dcp_noop(&self, cookie: &EngineCookie, opaque: u32) -> EngineResult<()> {
        self.inner.dcp_noop(cookie, opaque)
    }

    fn dcp_buffer_acknowledgement(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        acked_bytes: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner
            .dcp_buffer_acknowledgement(cookie, opaque, vbucket, acked_bytes, storage)
    }

    fn dcp_control(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        value: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()> {
        self.inner.dcp_control(cookie, key, value, storage)
    }

    fn dcp_step(
        &self,
        cookie: &EngineCookie,
        storage: &mut EngineStorage,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<bool> {
        self.inner.dcp_step(cookie, storage, producers)
    }
}

#[test]
// a would-blocked engine call suspends the connection; the completion
// callback resumes it and the response still comes out correct
fn would_block_get_resumes() {
    let engine = Arc::new(BlockingEngine::new());
    let buckets = BucketRegistry::new();
    buckets.insert("default", engine.clone());
    let (process, addr) = launch(buckets);

    let mut client = Client::connect(addr);

    client.request(OP_SET, 0, 1, 0, &set_extras(), b"k", b"blocked");
    assert_eq!(client.recv().status(), STATUS_SUCCESS);

    // arm the engine: the next get suspends and completes asynchronously
    engine.arm.store(true, Ordering::SeqCst);

    client.request(OP_GET, 0, 2, 0, &[], b"k", &[]);
    let response = client.recv();
    assert_eq!(response.status(), STATUS_SUCCESS);
    assert_eq!(response.value, b"blocked");
    assert_eq!(response.opaque, 2);

    // the connection is still healthy afterwards
    client.request(OP_NOOP, 0, 3, 0, &[], &[], &[]);
    assert_eq!(client.recv().status(), STATUS_SUCCESS);

    process.shutdown();
}
