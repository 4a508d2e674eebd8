// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::Bytes;

/// An item as returned by the engine. The value is a shared handle: holding a
/// clone on the connection's reserved list keeps the engine allocation alive
/// until the transmit which references it completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
    pub datatype: u8,
    /// absolute expiry in unix seconds, 0 for no expiry
    pub expiry: u32,
    pub seqno: u64,
}

impl Item {
    pub fn new(value: Bytes, flags: u32, datatype: u8, expiry: u32) -> Self {
        Self {
            value,
            flags,
            cas: 0,
            datatype,
            expiry,
            seqno: 0,
        }
    }
}

/// The outcome of a successful mutation: the new cas and where the mutation
/// landed in the vbucket sequence, for clients that negotiated mutation-seqno
/// responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub seqno: u64,
    pub vbucket_uuid: u64,
}

/// One entry of a vbucket failover log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Snapshot of a vbucket's sequence numbers for OBSERVE_SEQNO.
#[derive(Clone, Copy, Debug)]
pub struct ObserveState {
    pub vbucket_uuid: u64,
    pub last_persisted_seqno: u64,
    pub current_seqno: u64,
}

/// A fully-specified response produced by an engine's unknown-command hook.
#[derive(Clone, Debug, Default)]
pub struct RawResponse {
    pub status: u16,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub datatype: u8,
    pub cas: u64,
}
