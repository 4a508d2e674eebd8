// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The daemon core: the per-connection binary-protocol state machine and the
//! threads that drive it. A dedicated listener thread accepts connections and
//! hands them to worker threads in round-robin order; each worker owns a
//! reactor, a slab of connections, a spare-buffer pool, and a completion
//! queue through which engines finish would-blocked operations.

#[macro_use]
extern crate log;

#[macro_use]
extern crate metrics;

use common::signal::Signal;
use net::Token;

mod bucket;
mod connection;
mod connections;
mod cookie;
mod errmap;
mod executors;
mod listener;
mod pool;
mod process;
mod sasl;
mod statemachine;
mod worker;

pub use bucket::BucketRegistry;
pub use connection::{Connection, Priority, TransmitResult};
pub use connections::{ConnInfo, ConnectionRegistry};
pub use cookie::Cookie;
pub use process::{Process, ProcessBuilder};
pub use sasl::PlainAuthenticator;
pub use statemachine::State;

use std::sync::Arc;

const QUEUE_RETRIES: usize = 3;
const QUEUE_CAPACITY: usize = 64 * 1024;

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const WAKER_TOKEN: Token = Token(usize::MAX);

const THREAD_PREFIX: &str = "skua";

/// State shared by all threads: bucket bindings, the connection registry, and
/// the tunables connections are created with. Everything mutable in here is
/// guarded by its own mutex and only touched at accept/close/stats time.
pub struct Shared {
    pub buckets: BucketRegistry,
    pub connections: ConnectionRegistry,
    pub authenticator: PlainAuthenticator,
    pub buf_size: usize,
    pub max_reqs_per_event: usize,
    pub version: String,
}

pub(crate) type SharedRef = Arc<Shared>;
