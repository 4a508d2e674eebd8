// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Executors for the change-feed family, plus the producers adapter through
//! which `dcp_step` frames outbound messages. Outbound messages ride the
//! same iovec path as responses; item values go on the reserved list until
//! the transmit that references them completes.

use super::require_engine;
use crate::connection::Connection;
use crate::statemachine::State;

use bytes::Bytes;
use engine::{
    dcp_flags, DcpMessageProducers, EngineError, EngineResult, Item, StreamRequest,
};
use protocol_mcbp::{
    datatype, packet_extras, packet_key, packet_value, ClientOpcode, Status,
};

counter!(DCP_MESSAGES_SENT, "outbound change-feed messages framed");

/// Frames outbound messages produced by the engine onto the connection.
struct ConnectionProducers<'a> {
    conn: &'a mut Connection,
}

impl<'a> DcpMessageProducers for ConnectionProducers<'a> {
    fn marker(
        &mut self,
        opaque: u32,
        vbucket: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    ) -> EngineResult<()> {
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&start_seqno.to_be_bytes());
        extras.extend_from_slice(&end_seqno.to_be_bytes());
        extras.extend_from_slice(&flags.to_be_bytes());

        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpSnapshotMarker as u8,
            vbucket,
            opaque,
            0,
            datatype::RAW,
            &extras,
            &[],
            None,
        );
        Ok(())
    }

    fn mutation(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        item: &Item,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()> {
        // by_seqno(8) rev_seqno(8) flags(4) expiry(4) lock_time(4) nmeta(2) nru(1)
        let mut extras = Vec::with_capacity(31);
        extras.extend_from_slice(&by_seqno.to_be_bytes());
        extras.extend_from_slice(&rev_seqno.to_be_bytes());
        extras.extend_from_slice(&item.flags.to_be_bytes());
        extras.extend_from_slice(&item.expiry.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u16.to_be_bytes());
        extras.push(0);

        let value = if self.conn.dcp_no_value {
            None
        } else {
            Some(item.value.clone())
        };

        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpMutation as u8,
            vbucket,
            opaque,
            item.cas,
            item.datatype,
            &extras,
            key,
            value,
        );
        Ok(())
    }

    fn deletion(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()> {
        let mut extras = Vec::with_capacity(18);
        extras.extend_from_slice(&by_seqno.to_be_bytes());
        extras.extend_from_slice(&rev_seqno.to_be_bytes());
        extras.extend_from_slice(&0u16.to_be_bytes());

        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpDeletion as u8,
            vbucket,
            opaque,
            cas,
            datatype::RAW,
            &extras,
            key,
            None,
        );
        Ok(())
    }

    fn expiration(
        &mut self,
        opaque: u32,
        vbucket: u16,
        key: &[u8],
        cas: u64,
        by_seqno: u64,
        rev_seqno: u64,
    ) -> EngineResult<()> {
        let mut extras = Vec::with_capacity(18);
        extras.extend_from_slice(&by_seqno.to_be_bytes());
        extras.extend_from_slice(&rev_seqno.to_be_bytes());
        extras.extend_from_slice(&0u16.to_be_bytes());

        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpExpiration as u8,
            vbucket,
            opaque,
            cas,
            datatype::RAW,
            &extras,
            key,
            None,
        );
        Ok(())
    }

    fn stream_end(&mut self, opaque: u32, vbucket: u16, flags: u32) -> EngineResult<()> {
        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpStreamEnd as u8,
            vbucket,
            opaque,
            0,
            datatype::RAW,
            &flags.to_be_bytes(),
            &[],
            None,
        );
        Ok(())
    }

    fn noop(&mut self, opaque: u32) -> EngineResult<()> {
        DCP_MESSAGES_SENT.increment();
        self.conn.frame_dcp_message(
            ClientOpcode::DcpNoop as u8,
            0,
            opaque,
            0,
            datatype::RAW,
            &[],
            &[],
            None,
        );
        Ok(())
    }
}

/// Ask the engine to produce the next outbound message for this feed. On
/// would-block the connection keeps read readiness only until new data shows
/// up; on any hard failure the feed is torn down.
pub(crate) fn ship_dcp_log(conn: &mut Connection) {
    let engine = match conn.engine() {
        Some(engine) => engine,
        None => {
            conn.set_ewouldblock(true);
            return;
        }
    };
    let cookie = conn.engine_cookie();

    // move the storage out so the producers adapter may borrow the
    // connection while the engine holds the stream state
    let mut storage = conn.engine_storage.take();
    let mut producers = ConnectionProducers { conn: &mut *conn };
    let result = engine.dcp_step(&cookie, &mut storage, &mut producers);
    conn.engine_storage = storage;

    match result {
        Ok(_) => {}
        Err(EngineError::WouldBlock) => conn.set_ewouldblock(true),
        Err(e) => {
            warn!(
                "{}: change feed step failed ({}), closing {}",
                conn.id(),
                e,
                conn.description()
            );
            conn.set_state(State::Closing);
        }
    }
}

pub fn open_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 8 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (seqno, flags, name) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        (
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]),
            packet_key(&header, packet).to_vec(),
        )
    };

    let cookie = conn.engine_cookie();
    match engine.dcp_open(
        &cookie,
        header.opaque,
        seqno,
        flags,
        &name,
        &mut conn.engine_storage,
    ) {
        Ok(()) => {
            conn.set_dcp(true);
            conn.dcp_xattr_aware = flags & dcp_flags::INCLUDE_XATTRS != 0;
            conn.dcp_no_value = flags & dcp_flags::NO_VALUE != 0;
            conn.dcp_collection_aware = flags & dcp_flags::COLLECTIONS != 0;
            conn.dcp_delete_times = flags & dcp_flags::INCLUDE_DELETE_TIMES != 0;
            info!(
                "{}: opened change feed \"{}\" for {}",
                conn.id(),
                String::from_utf8_lossy(&name),
                conn.description()
            );
            conn.send_response_status(Status::Success);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn add_stream_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 4 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let flags = {
        let extras = packet_extras(&header, conn.packet());
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    };

    let cookie = conn.engine_cookie();
    match engine.dcp_add_stream(
        &cookie,
        header.opaque,
        header.vbucket,
        flags,
        &mut conn.engine_storage,
    ) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn close_stream_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let cookie = conn.engine_cookie();
    match engine.dcp_close_stream(
        &cookie,
        header.opaque,
        header.vbucket,
        &mut conn.engine_storage,
    ) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn stream_req_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 48 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let request = {
        let extras = packet_extras(&header, conn.packet());
        let read_u64 = |offset: usize| {
            u64::from_be_bytes([
                extras[offset],
                extras[offset + 1],
                extras[offset + 2],
                extras[offset + 3],
                extras[offset + 4],
                extras[offset + 5],
                extras[offset + 6],
                extras[offset + 7],
            ])
        };
        StreamRequest {
            flags: u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            start_seqno: read_u64(8),
            end_seqno: read_u64(16),
            vbucket_uuid: read_u64(24),
            snap_start_seqno: read_u64(32),
            snap_end_seqno: read_u64(40),
        }
    };

    let cookie = conn.engine_cookie();
    match engine.dcp_stream_req(
        &cookie,
        header.opaque,
        header.vbucket,
        request,
        &mut conn.engine_storage,
    ) {
        Ok(failover) => {
            let mut body = Vec::with_capacity(failover.len() * 16);
            for entry in failover {
                body.extend_from_slice(&entry.uuid.to_be_bytes());
                body.extend_from_slice(&entry.seqno.to_be_bytes());
            }
            conn.send_response(Status::Success, &[], &[], &body, datatype::RAW, 0);
        }
        Err(EngineError::Rollback) => {
            // a rollback response carries the seqno to roll back to
            match conn.remap_error(Status::Rollback) {
                Some(status) => {
                    let seqno = 0u64.to_be_bytes();
                    conn.send_raw_response(status, &[], &[], &seqno, datatype::RAW, 0);
                }
                None => conn.set_state(State::Closing),
            }
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn get_failover_log_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    match engine.dcp_get_failover_log(&conn.engine_cookie(), header.opaque, header.vbucket) {
        Ok(entries) => {
            let mut body = Vec::with_capacity(entries.len() * 16);
            for entry in entries {
                body.extend_from_slice(&entry.uuid.to_be_bytes());
                body.extend_from_slice(&entry.seqno.to_be_bytes());
            }
            conn.send_response(Status::Success, &[], &[], &body, datatype::RAW, 0);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

/// Success on the consumer-side stream messages produces no response; the
/// machine hops straight back to the next command.
fn finish_quiet(conn: &mut Connection, result: EngineResult<()>) {
    match result {
        Ok(()) => conn.set_state(State::NewCmd),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn stream_end_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 4 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let flags = {
        let extras = packet_extras(&header, conn.packet());
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    };

    let cookie = conn.engine_cookie();
    let result = engine.dcp_stream_end(
        &cookie,
        header.opaque,
        header.vbucket,
        flags,
        &mut conn.engine_storage,
    );
    finish_quiet(conn, result);
}

pub fn snapshot_marker_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 20 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (start, end, flags) = {
        let extras = packet_extras(&header, conn.packet());
        let read_u64 = |offset: usize| {
            u64::from_be_bytes([
                extras[offset],
                extras[offset + 1],
                extras[offset + 2],
                extras[offset + 3],
                extras[offset + 4],
                extras[offset + 5],
                extras[offset + 6],
                extras[offset + 7],
            ])
        };
        (
            read_u64(0),
            read_u64(8),
            u32::from_be_bytes([extras[16], extras[17], extras[18], extras[19]]),
        )
    };

    let cookie = conn.engine_cookie();
    let result = engine.dcp_snapshot_marker(
        &cookie,
        header.opaque,
        header.vbucket,
        start,
        end,
        flags,
        &mut conn.engine_storage,
    );
    finish_quiet(conn, result);
}

pub fn mutation_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 31 || header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, value, by_seqno, rev_seqno, flags, expiry) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        let read_u64 = |offset: usize| {
            u64::from_be_bytes([
                extras[offset],
                extras[offset + 1],
                extras[offset + 2],
                extras[offset + 3],
                extras[offset + 4],
                extras[offset + 5],
                extras[offset + 6],
                extras[offset + 7],
            ])
        };
        (
            packet_key(&header, packet).to_vec(),
            Bytes::copy_from_slice(packet_value(&header, packet)),
            read_u64(0),
            read_u64(8),
            u32::from_be_bytes([extras[16], extras[17], extras[18], extras[19]]),
            u32::from_be_bytes([extras[20], extras[21], extras[22], extras[23]]),
        )
    };

    let mut item = Item::new(value, flags, header.datatype, expiry);
    item.cas = header.cas;

    let cookie = conn.engine_cookie();
    let result = engine.dcp_mutation(
        &cookie,
        header.opaque,
        header.vbucket,
        &key,
        item,
        by_seqno,
        rev_seqno,
        &mut conn.engine_storage,
    );
    finish_quiet(conn, result);
}

fn removal_impl(conn: &mut Connection, expiration: bool) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 18 || header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, by_seqno, rev_seqno) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        let read_u64 = |offset: usize| {
            u64::from_be_bytes([
                extras[offset],
                extras[offset + 1],
                extras[offset + 2],
                extras[offset + 3],
                extras[offset + 4],
                extras[offset + 5],
                extras[offset + 6],
                extras[offset + 7],
            ])
        };
        (
            packet_key(&header, packet).to_vec(),
            read_u64(0),
            read_u64(8),
        )
    };

    let cookie = conn.engine_cookie();
    let result = if expiration {
        engine.dcp_expiration(
            &cookie,
            header.opaque,
            header.vbucket,
            &key,
            header.cas,
            by_seqno,
            rev_seqno,
            &mut conn.engine_storage,
        )
    } else {
        engine.dcp_deletion(
            &cookie,
            header.opaque,
            header.vbucket,
            &key,
            header.cas,
            by_seqno,
            rev_seqno,
            &mut conn.engine_storage,
        )
    };
    finish_quiet(conn, result);
}

pub fn deletion_executor(conn: &mut Connection) {
    removal_impl(conn, false);
}

pub fn expiration_executor(conn: &mut Connection) {
    removal_impl(conn, true);
}

pub fn flush_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let result = engine.dcp_flush(&conn.engine_cookie(), header.opaque, header.vbucket);
    finish_quiet(conn, result);
}

pub fn set_vbucket_state_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 1 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let state = packet_extras(&header, conn.packet())[0];

    let cookie = conn.engine_cookie();
    let result = engine.dcp_set_vbucket_state(
        &cookie,
        header.opaque,
        header.vbucket,
        u32::from(state),
        &mut conn.engine_storage,
    );
    finish_quiet(conn, result);
}

pub fn noop_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    match engine.dcp_noop(&conn.engine_cookie(), header.opaque) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn buffer_ack_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 4 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let acked = {
        let extras = packet_extras(&header, conn.packet());
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    };

    let cookie = conn.engine_cookie();
    let result = engine.dcp_buffer_acknowledgement(
        &cookie,
        header.opaque,
        header.vbucket,
        acked,
        &mut conn.engine_storage,
    );
    finish_quiet(conn, result);
}

pub fn control_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, value) = {
        let packet = conn.packet();
        (
            packet_key(&header, packet).to_vec(),
            packet_value(&header, packet).to_vec(),
        )
    };

    let cookie = conn.engine_cookie();
    match engine.dcp_control(&cookie, &key, &value, &mut conn.engine_storage) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}
