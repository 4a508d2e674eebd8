// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::{
    EngineResult, EngineStorage, FailoverEntry, Item, MutationResult, ObserveState, RawResponse,
};

use bytes::Bytes;

use std::sync::Arc;

/// How a store operation treats an existing item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreSemantics {
    /// store unconditionally
    Set,
    /// store only if the key does not exist
    Add,
    /// store only if the key exists
    Replace,
    /// concatenate after the existing value
    Append,
    /// concatenate before the existing value
    Prepend,
}

/// Callback seam used by engines to complete a would-block operation. The
/// implementation enqueues the completion on the worker owning the connection
/// and wakes its reactor.
pub trait IoNotify: Send + Sync {
    fn notify_io_complete(&self, token: usize, status: EngineResult<()>);
}

/// The command context handed to every engine call. Cloning it is cheap so an
/// engine can carry it to another thread and complete asynchronously.
#[derive(Clone)]
pub struct EngineCookie {
    token: usize,
    notifier: Arc<dyn IoNotify>,
}

impl EngineCookie {
    pub fn new(token: usize, notifier: Arc<dyn IoNotify>) -> Self {
        Self { token, notifier }
    }

    pub fn token(&self) -> usize {
        self.token
    }

    /// Signal that a previously would-blocked operation has finished with the
    /// given status. The connection resumes `execute` with the status in its
    /// async-status slot.
    pub fn notify(&self, status: EngineResult<()>) {
        self.notifier.notify_io_complete(self.token, status);
    }
}

impl std::fmt::Debug for EngineCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCookie")
            .field("token", &self.token)
            .finish()
    }
}

/// The key-value portion of the engine interface. Item allocation and release
/// from the original C-style interface are expressed through the owned `Item`
/// type: values are shared handles released when the last clone drops.
pub trait KvEngine: Send + Sync {
    fn get(&self, cookie: &EngineCookie, key: &[u8], vbucket: u16) -> EngineResult<Item>;

    /// Fetch an item only if it satisfies the filter.
    fn get_if(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        filter: &mut dyn FnMut(&Item) -> bool,
    ) -> EngineResult<Option<Item>>;

    fn get_and_touch(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        expiry: u32,
    ) -> EngineResult<Item>;

    fn get_locked(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<Item>;

    fn unlock(&self, cookie: &EngineCookie, key: &[u8], vbucket: u16, cas: u64)
        -> EngineResult<()>;

    /// Store an item. A nonzero `cas` makes the store conditional on the
    /// current item carrying that cas.
    fn store(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
    ) -> EngineResult<MutationResult>;

    /// Store an item only if the current state satisfies the predicate, which
    /// sees the existing item if there is one.
    fn store_if(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
        predicate: &mut dyn FnMut(Option<&Item>) -> bool,
    ) -> EngineResult<MutationResult>;

    /// Remove an item, optionally conditional on cas.
    fn remove(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationResult>;

    /// Increment or decrement a numeric value, optionally creating it.
    /// Returns the resulting value and the mutation descriptor.
    #[allow(clippy::too_many_arguments)]
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
    ) -> EngineResult<(u64, MutationResult)>;

    fn flush(&self, cookie: &EngineCookie) -> EngineResult<()>;

    /// Visit engine statistics as key/value pairs. An empty `key` requests
    /// the default group.
    fn stats(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        visitor: &mut dyn FnMut(&str, &str),
    ) -> EngineResult<()>;

    fn reset_stats(&self, cookie: &EngineCookie) -> EngineResult<()>;

    fn observe_seqno(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
        uuid: u64,
    ) -> EngineResult<ObserveState>;

    /// Block (logically) until the vbucket has persisted up to `seqno`.
    fn seqno_persistence(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
        seqno: u64,
    ) -> EngineResult<()>;

    fn get_failover_log(
        &self,
        cookie: &EngineCookie,
        vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>>;

    fn set_collections_manifest(&self, cookie: &EngineCookie, json: &[u8]) -> EngineResult<()>;

    fn get_collections_manifest(&self, cookie: &EngineCookie) -> EngineResult<Bytes>;

    /// Resolve a `scope.collection` path to (manifest uid, collection id).
    fn get_collection_id(&self, cookie: &EngineCookie, path: &str) -> EngineResult<(u64, u32)>;

    /// Fallback for opcodes the core does not recognise.
    fn unknown_command(&self, cookie: &EngineCookie, packet: &[u8]) -> EngineResult<RawResponse>;

    /// Called when a connection bound to this engine goes away so the engine
    /// can drop any state keyed on the cookie.
    fn on_disconnect(&self, cookie: &EngineCookie);
}

/// A stream request issued by a DCP client.
#[derive(Clone, Copy, Debug)]
pub struct StreamRequest {
    pub flags: u32,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub vbucket_uuid: u64,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
}

/// Callbacks through which `dcp_step` emits outbound messages. Implemented by
/// the connection layer, which frames each message and queues it for
/// transmission.
pub trait DcpMessageProducers {
    fn marker(
        &mut self,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn mutation(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        item: &Item,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()>;

    fn deletion(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()>;

    fn expiration(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()>;

    fn stream_end(&mut self, opaque: u32, vbucket: u16, flags: u32) -> EngineResult<()>;

    fn noop(&mut self, opaque: u32) -> EngineResult<()>;
}

/// The DCP (change feed) portion of the engine interface. Stream bookkeeping
/// lives in the connection's engine-storage slot, which is passed back into
/// each call.
pub trait DcpEngine: Send + Sync {
    fn dcp_open(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        seqno: u32,
        flags: u32,
        name: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    fn dcp_add_stream(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    fn dcp_close_stream(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    /// Returns the failover log to send with a successful stream request.
    fn dcp_stream_req(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        request: StreamRequest,
        storage: &mut EngineStorage,
    ) -> EngineResult<Vec<FailoverEntry>>;

    fn dcp_get_failover_log(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>>;

    fn dcp_stream_end(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn dcp_snapshot_marker(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
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
    ) -> EngineResult<()>;

    fn dcp_flush(&self, cookie: &EngineCookie, opaque: u32, vbucket: u16) -> EngineResult<()>;

    fn dcp_set_vbucket_state(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        state: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    fn dcp_noop(&self, cookie: &EngineCookie, opaque: u32) -> EngineResult<()>;

    fn dcp_buffer_acknowledgement(
        &self,
        cookie: &EngineCookie,
        opaque: u32,
        vbucket: u16,
        acked_bytes: u32,
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    fn dcp_control(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        value: &[u8],
        storage: &mut EngineStorage,
    ) -> EngineResult<()>;

    /// Produce the next outbound message(s) for a producer connection.
    /// `Ok(true)` when a message was produced (call again), `Ok(false)` when
    /// the producer had nothing but may soon, and `Err(WouldBlock)` when the
    /// connection should drop write interest until new data arrives.
    fn dcp_step(
        &self,
        cookie: &EngineCookie,
        storage: &mut EngineStorage,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<bool>;
}

/// The full engine interface a bucket exposes.
pub trait Engine: KvEngine + DcpEngine {}

impl<T: KvEngine + DcpEngine> Engine for T {}
