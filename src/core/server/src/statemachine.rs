// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The twelve-state machine which drives a connection from accept to close.
//! Each state function returns true to keep running states on this event, or
//! false to yield the worker until the next readiness event, engine
//! completion, or refcount change.

use crate::connection::{Connection, TransmitResult, TryReadResult};
use crate::cookie::PacketContent;
use crate::executors;

use net::{Interest, Registry};
use protocol_mcbp::{RequestHeader, HEADER_LEN};

use std::time::Instant;

counter!(PROCESS_REQ, "requests executed");
counter!(PROTOCOL_ERROR, "connections closed due to framing errors");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NewCmd,
    Waiting,
    ReadPacketHeader,
    ParseCmd,
    ReadPacketBody,
    Execute,
    SendData,
    ShipLog,
    Closing,
    PendingClose,
    ImmediateClose,
    Destroyed,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::NewCmd => "new_cmd",
            State::Waiting => "waiting",
            State::ReadPacketHeader => "read_packet_header",
            State::ParseCmd => "parse_cmd",
            State::ReadPacketBody => "read_packet_body",
            State::Execute => "execute",
            State::SendData => "send_data",
            State::ShipLog => "ship_log",
            State::Closing => "closing",
            State::PendingClose => "pending_close",
            State::ImmediateClose => "immediate_close",
            State::Destroyed => "destroyed",
        }
    }
}

impl Connection {
    /// Transition to a new state. Change-feed connections never block in
    /// `waiting`: they run the full-duplex state instead, and their slow-op
    /// timer resets when a fresh read begins. Entering `send_data` closes out
    /// the slow-operation timing for the command.
    pub fn set_state(&mut self, state: State) {
        if state == self.state {
            return;
        }

        let mut next = state;

        if self.is_dcp() {
            if next == State::Waiting {
                self.current_event.writable = true;
                next = State::ShipLog;
            }
            if next == State::ReadPacketHeader {
                self.start = None;
            }
        }

        if next == State::Closing {
            debug!(
                "{}: going from {} to {}",
                self.id(),
                self.state.name(),
                next.name()
            );
        } else {
            trace!(
                "{}: going from {} to {}",
                self.id(),
                self.state.name(),
                next.name()
            );
        }

        if next == State::SendData {
            if let Some(start) = self.start.take() {
                self.maybe_log_slow_command(start.elapsed());
            }
        }

        self.state = next;
    }

    /// Run the state machine until it yields. Called by the worker whenever
    /// the connection has a readiness event or a completed engine operation.
    pub fn run(&mut self, registry: &Registry) {
        let began = Instant::now();

        loop {
            let cont = match self.state {
                State::NewCmd => self.conn_new_cmd(registry),
                State::Waiting => self.conn_waiting(registry),
                State::ReadPacketHeader => self.conn_read_packet_header(),
                State::ParseCmd => self.conn_parse_cmd(),
                State::ReadPacketBody => self.conn_read_packet_body(registry),
                State::Execute => self.conn_execute(registry),
                State::SendData => self.conn_send_data(registry),
                State::ShipLog => self.conn_ship_log(registry),
                State::Closing => self.conn_closing(registry),
                State::PendingClose => self.conn_pending_close(),
                State::ImmediateClose => self.conn_immediate_close(),
                State::Destroyed => false,
            };

            if !cont {
                break;
            }
        }

        self.add_cpu_time(began.elapsed());
    }

    /// Prepare for the next command: reset the cookie, shrink oversized
    /// buffers, and pick the next state based on what is already buffered.
    fn reset_cmd(&mut self) {
        self.cookie.reset();
        self.shrink_buffers();

        let buffered = self.read.as_ref().map(|p| p.rsize()).unwrap_or(0);
        if buffered >= HEADER_LEN {
            self.set_state(State::ParseCmd);
        } else if self.is_tls() {
            self.set_state(State::ReadPacketHeader);
        } else {
            self.set_state(State::Waiting);
        }
    }

    fn conn_new_cmd(&mut self, registry: &Registry) -> bool {
        self.start = None;

        if let Some(write) = self.write.as_ref() {
            if !write.empty() {
                warn!(
                    "{}: expected write pipe to be empty, has {} bytes",
                    self.id(),
                    write.rsize()
                );
            }
        }

        // each connection only processes a bounded number of operations per
        // event so its siblings on the worker get served too
        if self.decrement_num_events() >= 0 {
            self.reset_cmd();
            return true;
        }

        crate::connection::CONN_YIELDS.increment();

        // with input already buffered no read event will come; use write
        // readiness as the wakeup, since writability is usually immediate
        if self.have_pending_input() || self.is_dcp() {
            if !self.update_event(registry, Interest::WRITABLE) {
                self.set_state(State::Closing);
                return true;
            }
        }
        false
    }

    fn conn_waiting(&mut self, registry: &Registry) -> bool {
        if !self.update_event(registry, Interest::READABLE) {
            self.set_state(State::Closing);
            return true;
        }
        self.set_state(State::ReadPacketHeader);
        false
    }

    fn conn_read_packet_header(&mut self) -> bool {
        match self.try_read_network() {
            TryReadResult::NoDataReceived => {
                self.set_state(State::Waiting);
            }
            TryReadResult::DataReceived => {
                let buffered = self.read.as_ref().map(|p| p.rsize()).unwrap_or(0);
                if buffered >= HEADER_LEN {
                    self.set_state(State::ParseCmd);
                } else {
                    self.set_state(State::Waiting);
                }
            }
            TryReadResult::SocketClosed | TryReadResult::SocketError => {
                self.set_state(State::Closing);
            }
        }
        true
    }

    fn conn_parse_cmd(&mut self) -> bool {
        self.try_read_command();
        !self.is_ewouldblock()
    }

    /// Validate the buffered header and route to execution or body read.
    /// Framing errors are fatal for the connection.
    pub(crate) fn try_read_command(&mut self) {
        let max_packet = self.max_packet_size;
        let (header, total) = {
            let pipe = self.read.as_ref().expect("parse requires a read pipe");
            debug_assert!(pipe.rsize() >= HEADER_LEN);

            let header = match RequestHeader::parse(pipe.rdata()) {
                Ok(header) => header,
                Err(e) => {
                    PROTOCOL_ERROR.increment();
                    warn!(
                        "{}: invalid packet header ({}), closing {}",
                        self.id(),
                        e,
                        self.description()
                    );
                    self.set_state(State::Closing);
                    return;
                }
            };

            if let Err(e) = header.validate(max_packet) {
                PROTOCOL_ERROR.increment();
                warn!(
                    "{}: protocol error ({}), closing {}",
                    self.id(),
                    e,
                    self.description()
                );
                self.set_state(State::Closing);
                return;
            }

            (header, header.total_len())
        };

        if self.start.is_none() {
            self.start = Some(Instant::now());
        }

        let buffered = self.read.as_ref().map(|p| p.rsize()).unwrap_or(0);
        if buffered >= total {
            self.cookie.set_packet(header, PacketContent::Full);
            self.set_state(State::Execute);
        } else {
            let shortfall = total - buffered;
            self.read
                .as_mut()
                .expect("parse requires a read pipe")
                .ensure_capacity(shortfall);
            self.cookie.set_packet(header, PacketContent::HeaderOnly);
            self.set_state(State::ReadPacketBody);
        }
    }

    fn conn_read_packet_body(&mut self, registry: &Registry) -> bool {
        assert!(
            !self.is_packet_available(),
            "read_packet_body entered with the packet already complete"
        );

        match self.try_read_network() {
            TryReadResult::DataReceived => {
                if self.is_packet_available() {
                    self.cookie.upgrade_to_full();
                    self.set_state(State::Execute);
                    return true;
                }
                // partial body and the socket is drained; wait for more
                if !self.update_event(registry, Interest::READABLE) {
                    self.set_state(State::Closing);
                    return true;
                }
                false
            }
            TryReadResult::NoDataReceived => {
                if !self.update_event(registry, Interest::READABLE) {
                    self.set_state(State::Closing);
                    return true;
                }
                false
            }
            TryReadResult::SocketClosed | TryReadResult::SocketError => {
                self.set_state(State::Closing);
                true
            }
        }
    }

    fn conn_execute(&mut self, registry: &Registry) -> bool {
        assert!(
            self.is_packet_available(),
            "execute entered without the full packet in memory"
        );

        self.set_ewouldblock(false);

        executors::execute_packet(self);
        PROCESS_REQ.increment();

        if self.is_ewouldblock() {
            // engine call suspended; clear event registration and wait for
            // the completion callback to reschedule us
            let _ = self.unregister_event(registry);
            return false;
        }

        assert!(
            self.state != State::Execute,
            "executor completed without leaving the execute state"
        );

        // release the executed packet's bytes; the next command starts at
        // the head of the read pipe
        let total = self
            .cookie
            .header()
            .expect("executed packet must have a header")
            .total_len();
        self.read
            .as_mut()
            .expect("execute requires a read pipe")
            .consumed(total)
            .expect("executed packet no longer in the read pipe");

        true
    }

    fn conn_send_data(&mut self, registry: &Registry) -> bool {
        match self.transmit(registry) {
            TransmitResult::Complete => {
                // everything referenced by the segment list is on the wire
                self.release_temp_allocs();
                self.release_reserved_items();
                let next = self.write_and_go;
                self.set_state(next);
                true
            }
            TransmitResult::Incomplete => {
                debug!("{}: incomplete transfer, will retry", self.id());
                true
            }
            TransmitResult::SoftError => false,
            TransmitResult::HardError => true,
        }
    }

    /// The full-duplex state for change feeds: inbound acks are parsed and
    /// executed, and the engine is asked to produce outbound messages while
    /// the event budget lasts.
    fn conn_ship_log(&mut self, registry: &Registry) -> bool {
        if self.is_socket_closed() {
            return false;
        }

        let mut cont = false;
        let mut mask = Interest::READABLE.add(Interest::WRITABLE);

        if self.current_event.readable || self.have_pending_input() {
            self.current_event.readable = false;

            let buffered = self.read.as_ref().map(|p| p.rsize()).unwrap_or(0);
            if buffered >= HEADER_LEN {
                self.try_read_command();
            } else {
                self.set_state(State::ReadPacketHeader);
            }

            cont = true;

            // process the whole inbound queue rather than backing off after
            // a subset, otherwise a burst of acks slowly accumulates
            let budget = self.max_reqs_per_event();
            self.set_num_events(budget);
        } else if self.current_event.writable {
            if self.decrement_num_events() >= 0 {
                self.set_ewouldblock(false);
                executors::ship_dcp_log(self);
                if self.is_ewouldblock() {
                    // producer has nothing to send; wait for inbound traffic
                    mask = Interest::READABLE;
                    self.current_event.writable = false;
                } else {
                    cont = true;
                }
            } else {
                self.current_event.writable = false;
            }
        }

        if self.state == State::ShipLog && !self.update_event(registry, mask) {
            warn!(
                "{}: unable to update events for full-duplex stream, closing {}",
                self.id(),
                self.description()
            );
            self.set_state(State::Closing);
            return true;
        }

        cont
    }

    fn conn_closing(&mut self, registry: &Registry) -> bool {
        self.cookie.reset();
        self.release_reserved_items();
        self.release_temp_allocs();
        self.close_socket(registry);

        if self.refcount() > 1 || self.is_ewouldblock() {
            self.set_state(State::PendingClose);
        } else {
            self.set_state(State::ImmediateClose);
        }
        true
    }

    fn conn_pending_close(&mut self) -> bool {
        assert!(
            self.is_socket_closed(),
            "pending_close entered with the socket still open"
        );
        debug!(
            "{}: awaiting clients to release the connection (refcount {})",
            self.id(),
            self.refcount()
        );

        self.fire_disconnect();

        if self.refcount() > 1 {
            return false;
        }

        self.set_state(State::ImmediateClose);
        true
    }

    fn conn_immediate_close(&mut self) -> bool {
        assert!(
            self.is_socket_closed(),
            "immediate_close entered with the socket still open"
        );

        self.shared
            .connections
            .deregister(self.id(), self.parent_port());
        self.fire_disconnect();
        self.disassociate_bucket();

        // the worker frees the connection at the end of the reactor tick
        self.set_state(State::Destroyed);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(State::NewCmd.name(), "new_cmd");
        assert_eq!(State::ShipLog.name(), "ship_log");
        assert_eq!(State::Destroyed.name(), "destroyed");
    }
}
