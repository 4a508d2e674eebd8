// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-client connection state: the socket, the read/write pipes (possibly on
//! loan from the worker), the scatter-gather segment list, negotiated
//! features, bucket binding, and the cookie for the in-flight command. The
//! state machine driving all of this lives in `statemachine.rs`.

use crate::errmap::engine_error_status;
use crate::statemachine::State;
use crate::{Cookie, SharedRef};

use bytes::Bytes;
use engine::{Engine, EngineCookie, EngineError, EngineResult, EngineStorage, IoNotify};
use net::{Interest, Registry, Stream, Token};
use pipe::Pipe;
use protocol_mcbp::{datatype, Magic, RequestHeader, ResponseHeader, Status};

use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

counter!(CONN_YIELDS, "connections yielding due to event budget");
counter!(BYTES_READ, "bytes read from client sockets");
counter!(BYTES_WRITTEN, "bytes written to client sockets");
counter!(SLOW_COMMAND, "commands exceeding their slow-op threshold");

/// The longest agent name the core preserves for a connection.
pub const MAX_AGENT_NAME: usize = 32;

/// The longest client-supplied connection identifier the core preserves.
pub const MAX_CONNECTION_ID: usize = 33;

/// Scheduling priority, which scales the per-event command budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Outcome of a transmit pass over the pending iovec segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitResult {
    /// everything pending was written
    Complete,
    /// some progress, more remains
    Incomplete,
    /// the socket is full; write readiness has been re-armed
    SoftError,
    /// the socket is broken; the connection is closing
    HardError,
}

/// Outcome of draining the socket into the read pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryReadResult {
    DataReceived,
    NoDataReceived,
    SocketClosed,
    SocketError,
}

/// Feature flags negotiated through HELLO.
#[derive(Clone, Copy, Debug, Default)]
pub struct Features {
    pub json: bool,
    pub tcp_nodelay: bool,
    pub mutation_seqno: bool,
    pub xattr: bool,
    pub xerror: bool,
    pub select_bucket: bool,
    pub snappy: bool,
    pub duplex: bool,
    pub clustermap_notify: bool,
    pub unordered_execution: bool,
    pub tracing: bool,
    pub alt_request: bool,
    pub collections: bool,
    pub delete_times: bool,
}

/// Readiness flags for the event currently being handled, consulted by the
/// full-duplex state.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentEvent {
    pub readable: bool,
    pub writable: bool,
}

/// One entry in the scatter-gather list: either the next `len` unsent bytes
/// of the write pipe, or an owned byte handle (an engine item value or a
/// dynamic buffer).
enum IoSegment {
    Pipe { len: usize },
    Owned { data: Bytes, offset: usize },
}

pub struct Connection {
    token: Token,
    id: u32,
    stream: Option<Stream>,
    peername: String,
    sockname: String,
    parent_port: u16,

    pub(crate) state: State,
    pub(crate) write_and_go: State,

    pub(crate) read: Option<Pipe>,
    pub(crate) write: Option<Pipe>,
    iov: VecDeque<IoSegment>,
    reserved_items: Vec<Bytes>,
    temp_allocs: Vec<Bytes>,

    pub(crate) features: Features,
    priority: Priority,
    refcount: u8,

    engine_handle: Option<Arc<dyn Engine>>,
    bucket_name: String,

    username: Option<String>,
    authenticated: bool,

    dcp: bool,
    pub(crate) dcp_xattr_aware: bool,
    pub(crate) dcp_no_value: bool,
    pub(crate) dcp_collection_aware: bool,
    pub(crate) dcp_delete_times: bool,

    base_reqs_per_event: usize,
    num_events: i64,
    pub(crate) start: Option<Instant>,

    ewouldblock: bool,
    aiostat: EngineResult<()>,

    pub(crate) cookie: Cookie,
    pub(crate) engine_storage: EngineStorage,

    registered: Option<Interest>,
    pub(crate) current_event: CurrentEvent,

    agent_name: Option<String>,
    connection_id: Option<String>,
    dropped_privileges: std::collections::HashSet<&'static str>,
    verbosity: u32,
    cpu_time: Duration,
    disconnect_notified: bool,

    pub(crate) shared: SharedRef,
    notifier: Arc<dyn IoNotify>,
    pub(crate) max_packet_size: u32,
}

impl Connection {
    pub fn new(
        stream: Stream,
        token: Token,
        shared: SharedRef,
        notifier: Arc<dyn IoNotify>,
    ) -> Self {
        let id = stream.as_raw_fd() as u32;
        let peername = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let sockname = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let parent_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);

        let engine_handle = shared.buckets.default_bucket();
        let bucket_name = if engine_handle.is_some() {
            crate::bucket::DEFAULT_BUCKET.to_string()
        } else {
            String::new()
        };

        let base_reqs_per_event = shared.max_reqs_per_event;
        let max_packet_size = protocol_mcbp::DEFAULT_MAX_PACKET_SIZE;

        Self {
            token,
            id,
            stream: Some(stream),
            peername,
            sockname,
            parent_port,
            state: State::NewCmd,
            write_and_go: State::NewCmd,
            read: None,
            write: None,
            iov: VecDeque::new(),
            reserved_items: Vec::new(),
            temp_allocs: Vec::new(),
            features: Features::default(),
            priority: Priority::Medium,
            refcount: 1,
            engine_handle,
            bucket_name,
            username: None,
            authenticated: false,
            dcp: false,
            dcp_xattr_aware: false,
            dcp_no_value: false,
            dcp_collection_aware: false,
            dcp_delete_times: false,
            base_reqs_per_event,
            num_events: base_reqs_per_event as i64,
            start: None,
            ewouldblock: false,
            aiostat: Ok(()),
            cookie: Cookie::new(),
            engine_storage: None,
            registered: None,
            current_event: CurrentEvent::default(),
            agent_name: None,
            connection_id: None,
            dropped_privileges: std::collections::HashSet::new(),
            verbosity: 0,
            cpu_time: Duration::default(),
            disconnect_notified: false,
            shared,
            notifier,
            max_packet_size,
        }
    }

    /// An identifier for this connection. By default the socket descriptor;
    /// clients may provide a string identifier through HELLO for logs.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn parent_port(&self) -> u16 {
        self.parent_port
    }

    pub fn peername(&self) -> &str {
        &self.peername
    }

    /// "[peer - local]", used in log records.
    pub fn description(&self) -> String {
        match &self.connection_id {
            Some(cid) => format!("[{} - {} ({})]", self.peername, self.sockname, cid),
            None => format!("[{} - {}]", self.peername, self.sockname),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_dcp(&self) -> bool {
        self.dcp
    }

    pub fn set_dcp(&mut self, dcp: bool) {
        self.dcp = dcp;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// The per-event command budget, scaled by priority.
    pub fn max_reqs_per_event(&self) -> usize {
        match self.priority {
            Priority::High => self.base_reqs_per_event * 2,
            Priority::Medium => self.base_reqs_per_event,
            Priority::Low => std::cmp::max(1, self.base_reqs_per_event / 2),
        }
    }

    pub fn set_num_events(&mut self, n: usize) {
        self.num_events = n as i64;
    }

    pub fn decrement_num_events(&mut self) -> i64 {
        self.num_events -= 1;
        self.num_events
    }

    pub fn refcount(&self) -> u8 {
        self.refcount
    }

    pub fn increment_refcount(&mut self) {
        self.refcount += 1;
    }

    pub fn decrement_refcount(&mut self) {
        self.refcount -= 1;
    }

    pub fn is_ewouldblock(&self) -> bool {
        self.ewouldblock
    }

    pub fn set_ewouldblock(&mut self, ewouldblock: bool) {
        self.ewouldblock = ewouldblock;
    }

    pub fn set_aiostat(&mut self, status: EngineResult<()>) {
        self.aiostat = status;
    }

    /// Fetch and clear the async status, also clearing the would-block flag.
    /// Every executor starts with this.
    pub fn take_aiostat(&mut self) -> EngineResult<()> {
        self.ewouldblock = false;
        std::mem::replace(&mut self.aiostat, Ok(()))
    }

    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.engine_handle.clone()
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn bind_bucket(&mut self, name: &str, engine: Arc<dyn Engine>) {
        self.bucket_name = name.to_string();
        self.engine_handle = Some(engine);
        self.shared.connections.set_bucket(self.id, name);
    }

    pub fn disassociate_bucket(&mut self) {
        self.engine_handle = None;
        self.bucket_name.clear();
    }

    /// The cookie handed to engine calls, carrying enough to complete a
    /// would-blocked operation from any thread.
    pub fn engine_cookie(&self) -> EngineCookie {
        EngineCookie::new(self.token.0, self.notifier.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, username: Option<String>) {
        self.authenticated = username.is_some();
        self.username = username;
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_agent_name(&mut self, name: &str) {
        let mut name = name.to_string();
        name.truncate(MAX_AGENT_NAME);
        self.agent_name = Some(name);
    }

    pub fn set_connection_id(&mut self, id: &str) {
        let mut id = id.to_string();
        id.truncate(MAX_CONNECTION_ID);
        self.connection_id = Some(id);
    }

    /// Drop a privilege from the connection's context. Returns false for
    /// privilege names the core does not know about.
    pub fn drop_privilege(&mut self, name: &str) -> bool {
        const KNOWN: &[&str] = &[
            "Read",
            "Write",
            "Insert",
            "Delete",
            "Upsert",
            "SimpleStats",
            "DcpProducer",
            "DcpConsumer",
        ];
        match KNOWN.iter().find(|known| **known == name) {
            Some(known) => {
                self.dropped_privileges.insert(known);
                true
            }
            None => false,
        }
    }

    pub fn has_privilege(&self, name: &str) -> bool {
        !self.dropped_privileges.contains(name)
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: u32) {
        self.verbosity = verbosity;
    }

    pub fn set_tcp_nodelay(&mut self, enable: bool) -> bool {
        match self.stream.as_mut() {
            Some(stream) => stream.set_nodelay(enable).is_ok(),
            None => false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false)
    }

    pub fn is_socket_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn should_delete(&self) -> bool {
        self.state == State::Destroyed
    }

    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    pub(crate) fn add_cpu_time(&mut self, amt: Duration) {
        self.cpu_time += amt;
    }

    pub fn set_current_event(&mut self, readable: bool, writable: bool) {
        self.current_event = CurrentEvent { readable, writable };
    }

    // ------------------------------------------------------------------
    // event registration
    // ------------------------------------------------------------------

    /// Set the connection's event registration to exactly `interest`.
    /// Returns false if the reactor refused, in which case the caller closes
    /// the connection.
    pub fn update_event(&mut self, registry: &Registry, interest: Interest) -> bool {
        let token = self.token;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false,
        };

        let result = if self.registered.is_some() {
            registry.reregister(stream, token, interest)
        } else {
            registry.register(stream, token, interest)
        };

        match result {
            Ok(()) => {
                self.registered = Some(interest);
                true
            }
            Err(e) => {
                warn!("{}: unable to update event registration: {}", self.id, e);
                false
            }
        }
    }

    /// Clear the event registration entirely, used when suspending on a
    /// would-blocked engine call and when closing.
    pub fn unregister_event(&mut self, registry: &Registry) -> bool {
        if self.registered.is_none() {
            return true;
        }
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false,
        };
        match registry.deregister(stream) {
            Ok(()) => {
                self.registered = None;
                true
            }
            Err(e) => {
                warn!("{}: unable to clear event registration: {}", self.id, e);
                false
            }
        }
    }

    pub(crate) fn close_socket(&mut self, registry: &Registry) {
        let _ = self.unregister_event(registry);
        // dropping the stream closes the descriptor; any queued response
        // segments will never be sent
        self.iov.clear();
        if let Some(pipe) = self.write.as_mut() {
            pipe.clear();
        }
        self.stream = None;
    }

    // ------------------------------------------------------------------
    // reading
    // ------------------------------------------------------------------

    /// Drain the socket into the read pipe. The reactor is edge-triggered, so
    /// this must keep reading until the socket reports would-block before the
    /// connection sleeps on read readiness.
    pub fn try_read_network(&mut self) -> TryReadResult {
        let buf_size = self.shared.buf_size;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return TryReadResult::SocketError,
        };
        let pipe = match self.read.as_mut() {
            Some(pipe) => pipe,
            None => return TryReadResult::SocketError,
        };

        let mut received = 0;

        loop {
            if pipe.wsize() == 0 {
                pipe.ensure_capacity(buf_size);
            }

            match pipe.produce(|buf| stream.read(buf)) {
                Ok(0) => {
                    return TryReadResult::SocketClosed;
                }
                Ok(n) => {
                    BYTES_READ.add(n as u64);
                    received += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return if received > 0 {
                        TryReadResult::DataReceived
                    } else {
                        TryReadResult::NoDataReceived
                    };
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("{}: read error: {}", self.id, e);
                    return TryReadResult::SocketError;
                }
            }
        }
    }

    /// True when the cookie's packet is completely buffered in the read pipe.
    pub fn is_packet_available(&self) -> bool {
        match (self.cookie.header(), self.read.as_ref()) {
            (Some(header), Some(pipe)) => pipe.rsize() >= header.total_len(),
            _ => false,
        }
    }

    /// The full packet currently at the head of the read pipe.
    pub fn packet(&self) -> &[u8] {
        let header = self
            .cookie
            .header()
            .expect("packet() requires a parsed header");
        let pipe = self.read.as_ref().expect("packet() requires a read pipe");
        &pipe.rdata()[..header.total_len()]
    }

    pub fn have_pending_input(&self) -> bool {
        self.read.as_ref().map(|p| !p.empty()).unwrap_or(false)
    }

    pub(crate) fn shrink_buffers(&mut self) {
        if let Some(pipe) = self.read.as_mut() {
            pipe.shrink();
        }
        if let Some(pipe) = self.write.as_mut() {
            pipe.shrink();
        }
    }

    // ------------------------------------------------------------------
    // response framing
    // ------------------------------------------------------------------

    fn enabled_datatypes(&self, datatype: u8) -> u8 {
        let mut mask = 0;
        if self.features.json {
            mask |= datatype::JSON;
        }
        if self.features.snappy {
            mask |= datatype::SNAPPY;
        }
        if self.features.xattr {
            mask |= datatype::XATTR;
        }
        datatype & mask
    }

    fn push_pipe_segment(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let pipe = self.write.as_mut().expect("write pipe required");
        pipe.ensure_capacity(data.len());
        pipe.wdata()[..data.len()].copy_from_slice(data);
        pipe.produced(data.len())
            .expect("pipe capacity was just ensured");
        self.iov.push_back(IoSegment::Pipe { len: data.len() });
    }

    fn push_owned_segment(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.iov.push_back(IoSegment::Owned { data, offset: 0 });
    }

    fn assert_response_clear(&self) {
        // a second response while one is still queued would alias the pipe
        // regions the segment list points into
        assert!(
            self.iov.is_empty()
                && self.write.as_ref().map(|w| w.empty()).unwrap_or(true),
            "response framing requires an empty write pipe"
        );
    }

    /// Frame a response with no body, substituting the JSON error body for
    /// non-success statuses that carry context. NotMyVbucket suppresses the
    /// error body: the vbucket map travels by another mechanism.
    pub fn send_response_status(&mut self, status: Status) {
        let body = if !status.is_success() && status != Status::NotMyVbucket {
            self.cookie.error_json().unwrap_or_default()
        } else {
            String::new()
        };
        let datatype = if body.is_empty() {
            datatype::RAW
        } else {
            datatype::JSON
        };
        let cas = if status.is_success() {
            self.cookie.cas()
        } else {
            0
        };

        self.frame_response(status, &[], &[], body.as_bytes(), datatype, cas);
        self.set_state(State::SendData);
        self.write_and_go = State::NewCmd;
    }

    /// Frame a full response. Error statuses discard the provided sections
    /// and carry the JSON error body instead.
    pub fn send_response(
        &mut self,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        datatype: u8,
        cas: u64,
    ) {
        if !status.is_success() {
            self.send_response_status(status);
            return;
        }

        self.cookie.set_cas(cas);
        self.frame_response(status, extras, key, value, datatype, cas);
        self.set_state(State::SendData);
        self.write_and_go = State::NewCmd;
    }

    /// Frame a success response whose value is an engine item. The value is
    /// not copied: the segment references the item bytes and a clone goes on
    /// the reserved list until the transmit completes.
    pub fn send_item_response(
        &mut self,
        extras: &[u8],
        key: &[u8],
        value: Bytes,
        datatype: u8,
        cas: u64,
    ) {
        self.assert_response_clear();
        self.cookie.set_cas(cas);

        let header = self
            .cookie
            .header()
            .expect("response framing requires a request");
        let response = ResponseHeader {
            opcode: header.opcode,
            keylen: key.len() as u16,
            extlen: extras.len() as u8,
            datatype: self.enabled_datatypes(datatype),
            status: Status::Success,
            bodylen: (extras.len() + key.len() + value.len()) as u32,
            opaque: header.opaque,
            cas,
        };

        self.push_pipe_segment(&response.to_bytes());
        self.push_pipe_segment(extras);
        self.push_pipe_segment(key);
        self.reserved_items.push(value.clone());
        self.push_owned_segment(value);

        self.set_state(State::SendData);
        self.write_and_go = State::NewCmd;
    }

    fn frame_response(
        &mut self,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        datatype: u8,
        cas: u64,
    ) {
        self.assert_response_clear();

        let header = self
            .cookie
            .header()
            .expect("response framing requires a request");
        let response = ResponseHeader {
            opcode: header.opcode,
            keylen: key.len() as u16,
            extlen: extras.len() as u8,
            datatype: self.enabled_datatypes(datatype),
            status,
            bodylen: (extras.len() + key.len() + value.len()) as u32,
            opaque: header.opaque,
            cas,
        };

        self.push_pipe_segment(&response.to_bytes());
        self.push_pipe_segment(extras);
        self.push_pipe_segment(key);
        self.push_pipe_segment(value);
    }

    /// Frame a response with explicit sections regardless of status, used
    /// where an error status carries a payload (stream-request rollback, an
    /// engine's own commands).
    pub(crate) fn send_raw_response(
        &mut self,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        datatype: u8,
        cas: u64,
    ) {
        self.frame_response(status, extras, key, value, datatype, cas);
        self.set_state(State::SendData);
        self.write_and_go = State::NewCmd;
    }

    /// Queue the cookie's dynamic buffer (a pre-framed packet sequence, used
    /// by STAT) for transmission.
    pub fn send_dynamic_buffer(&mut self) {
        self.assert_response_clear();
        let buffer = Bytes::from(self.cookie.take_dynamic_buffer());
        self.temp_allocs.push(buffer.clone());
        self.push_owned_segment(buffer);
        self.set_state(State::SendData);
        self.write_and_go = State::NewCmd;
    }

    /// Frame an outbound change-feed message (a client-request frame, since
    /// the producer originates it) and queue it for transmission, returning
    /// to the full-duplex state afterwards.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn frame_dcp_message(
        &mut self,
        opcode: u8,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        datatype: u8,
        extras: &[u8],
        key: &[u8],
        value: Option<Bytes>,
    ) {
        self.assert_response_clear();

        let value_len = value.as_ref().map(|v| v.len()).unwrap_or(0);
        let header = RequestHeader {
            magic: Magic::ClientRequest,
            opcode,
            keylen: key.len() as u16,
            extlen: extras.len() as u8,
            datatype,
            vbucket,
            bodylen: (extras.len() + key.len() + value_len) as u32,
            opaque,
            cas,
        };

        self.push_pipe_segment(&header.to_bytes());
        self.push_pipe_segment(extras);
        self.push_pipe_segment(key);
        if let Some(value) = value {
            self.reserved_items.push(value.clone());
            self.push_owned_segment(value);
        }

        self.set_state(State::SendData);
        self.write_and_go = State::ShipLog;
    }

    /// Handle a non-success engine result per the executor contract:
    /// would-block suspends, disconnect closes, domain errors are remapped
    /// and surfaced as a response.
    pub fn respond_engine_error(&mut self, error: EngineError) {
        match error {
            EngineError::WouldBlock => {
                self.ewouldblock = true;
            }
            EngineError::Disconnect => {
                self.set_state(State::Closing);
            }
            error => {
                let status = engine_error_status(error);
                // surface a context string to clients that can express it
                if self.features.xerror && self.cookie.error_context().is_empty() {
                    self.cookie.set_error_context(error.to_string());
                }
                match self.remap_error(status) {
                    Some(status) => self.send_response_status(status),
                    None => {
                        info!(
                            "{}: closing connection {}: status {:?} requires XERROR",
                            self.id,
                            self.description(),
                            status
                        );
                        self.set_state(State::Closing);
                    }
                }
            }
        }
    }

    /// The error remap policy: clients that did not negotiate XERROR cannot
    /// be sent extended codes, so those collapse to a disconnect.
    pub fn remap_error(&self, status: Status) -> Option<Status> {
        if status.is_legacy() || self.features.xerror {
            Some(status)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // transmission
    // ------------------------------------------------------------------

    pub(crate) fn release_reserved_items(&mut self) {
        self.reserved_items.clear();
    }

    pub(crate) fn release_temp_allocs(&mut self) {
        self.temp_allocs.clear();
    }

    /// Write the pending segments to the socket with scatter-gather I/O.
    pub fn transmit(&mut self, registry: &Registry) -> TransmitResult {
        if self.stream.is_none() {
            self.set_state(State::Closing);
            return TransmitResult::HardError;
        }

        loop {
            if self.iov.is_empty() {
                // everything queued has been handed to the stream; finish any
                // stream-level flush (TLS ciphertext)
                let stream = self.stream.as_mut().expect("stream checked above");
                match stream.flush() {
                    Ok(()) => {
                        if let Some(pipe) = self.write.as_mut() {
                            pipe.clear();
                        }
                        return TransmitResult::Complete;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        if !self.update_event(registry, Interest::WRITABLE) {
                            self.set_state(State::Closing);
                            return TransmitResult::HardError;
                        }
                        return TransmitResult::SoftError;
                    }
                    Err(e) => {
                        info!("{}: flush error, closing: {}", self.id, e);
                        self.set_state(State::Closing);
                        return TransmitResult::HardError;
                    }
                }
            }

            let result = {
                // field-disjoint borrows: slices reference the write pipe and
                // segment list while the stream is borrowed mutably
                let pipe_data: &[u8] = match self.write.as_ref() {
                    Some(pipe) => pipe.rdata(),
                    None => &[],
                };
                let mut slices = Vec::with_capacity(self.iov.len());
                let mut pipe_offset = 0;
                for segment in &self.iov {
                    match segment {
                        IoSegment::Pipe { len } => {
                            slices.push(IoSlice::new(&pipe_data[pipe_offset..pipe_offset + len]));
                            pipe_offset += len;
                        }
                        IoSegment::Owned { data, offset } => {
                            slices.push(IoSlice::new(&data[*offset..]));
                        }
                    }
                }

                let stream = self.stream.as_mut().expect("stream checked above");
                stream.write_vectored(&slices)
            };

            match result {
                Ok(0) => {
                    info!("{}: zero-length write, closing", self.id);
                    self.set_state(State::Closing);
                    return TransmitResult::HardError;
                }
                Ok(n) => {
                    BYTES_WRITTEN.add(n as u64);
                    self.advance_iov(n);
                    if !self.iov.is_empty() {
                        return TransmitResult::Incomplete;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !self.update_event(registry, Interest::WRITABLE) {
                        self.set_state(State::Closing);
                        return TransmitResult::HardError;
                    }
                    return TransmitResult::SoftError;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    info!("{}: write error, closing: {}", self.id, e);
                    self.set_state(State::Closing);
                    return TransmitResult::HardError;
                }
            }
        }
    }

    /// Mark `amt` transmitted bytes as done, consuming pipe bytes and
    /// advancing owned segments in order.
    fn advance_iov(&mut self, mut amt: usize) {
        let mut pipe_consumed = 0;

        while amt > 0 {
            let finished = {
                let segment = self
                    .iov
                    .front_mut()
                    .expect("advance_iov called past the end of the segment list");
                match segment {
                    IoSegment::Pipe { len } => {
                        let take = std::cmp::min(*len, amt);
                        *len -= take;
                        amt -= take;
                        pipe_consumed += take;
                        *len == 0
                    }
                    IoSegment::Owned { data, offset } => {
                        let remaining = data.len() - *offset;
                        let take = std::cmp::min(remaining, amt);
                        *offset += take;
                        amt -= take;
                        *offset == data.len()
                    }
                }
            };
            if finished {
                self.iov.pop_front();
            }
        }

        if pipe_consumed > 0 {
            self.write
                .as_mut()
                .expect("pipe segments require a write pipe")
                .consumed(pipe_consumed)
                .expect("segment list and pipe cursors out of sync");
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Record slow commands when the response is framed.
    pub(crate) fn maybe_log_slow_command(&self, elapsed: Duration) {
        let opcode = match self.cookie.header().and_then(|h| h.opcode()) {
            Some(opcode) => opcode,
            None => return,
        };
        let threshold = protocol_mcbp::sla::slow_op_threshold(opcode);
        if elapsed > threshold {
            SLOW_COMMAND.increment();
            let opaque = self.cookie.header().map(|h| h.opaque).unwrap_or(0);
            warn!(
                "{}: slow {} operation on connection {}: {:?} opaque:0x{:08x}",
                self.id,
                opcode,
                self.description(),
                elapsed,
                opaque
            );
        }
    }

    /// Ask the connection to start its shutdown sequence. Called by the
    /// worker when the process is going down.
    pub fn initiate_shutdown(&mut self) {
        match self.state {
            State::Closing | State::PendingClose | State::ImmediateClose | State::Destroyed => {}
            _ => self.set_state(State::Closing),
        }
    }

    /// True when the connection is parked waiting for input, which is when a
    /// shutdown signal can take effect immediately.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            State::NewCmd | State::Waiting | State::ReadPacketHeader
        )
    }

    pub fn signal_if_idle(&mut self) -> bool {
        if self.is_idle() {
            self.initiate_shutdown();
            true
        } else {
            false
        }
    }

    pub(crate) fn fire_disconnect(&mut self) {
        if self.disconnect_notified {
            return;
        }
        self.disconnect_notified = true;
        if let Some(engine) = self.engine() {
            engine.on_disconnect(&self.engine_cookie());
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peername)
            .field("state", &self.state)
            .field("dcp", &self.dcp)
            .finish()
    }
}
