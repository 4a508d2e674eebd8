// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Executors for the key-value commands. Command shapes follow the binary
//! protocol exactly: mutations carry flags+expiry extras, arithmetic carries
//! delta/initial/expiry, and responses include the mutation descriptor when
//! the client negotiated mutation-seqno.

use super::require_engine;
use crate::connection::Connection;

use bytes::Bytes;
use engine::{EngineError, Item, MutationResult, StoreSemantics};
use protocol_mcbp::{datatype, packet_extras, packet_key, packet_value, RequestHeader, Status};

/// Expiry sentinel in arithmetic extras meaning "do not create".
const ARITHMETIC_NO_CREATE: u32 = 0xffff_ffff;

fn copied_header(conn: &Connection) -> RequestHeader {
    *conn.cookie.header().expect("executor requires a header")
}

/// The response extras for a mutation: `(vbucket uuid, seqno)` when the
/// client asked for mutation descriptors, empty otherwise.
fn mutation_extras(conn: &Connection, result: &MutationResult) -> Vec<u8> {
    if conn.features.mutation_seqno {
        let mut extras = Vec::with_capacity(16);
        extras.extend_from_slice(&result.vbucket_uuid.to_be_bytes());
        extras.extend_from_slice(&result.seqno.to_be_bytes());
        extras
    } else {
        Vec::new()
    }
}

fn get_impl(conn: &mut Connection, include_key: bool) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if header.extlen != 0 || header.keylen == 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let key = packet_key(&header, conn.packet()).to_vec();
    match engine.get(&conn.engine_cookie(), &key, header.vbucket) {
        Ok(item) => {
            let extras = item.flags.to_be_bytes();
            let key_out = if include_key { key } else { Vec::new() };
            conn.send_item_response(&extras, &key_out, item.value, item.datatype, item.cas);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn get_executor(conn: &mut Connection) {
    get_impl(conn, false);
}

pub fn getk_executor(conn: &mut Connection) {
    get_impl(conn, true);
}

fn store_impl(conn: &mut Connection, semantics: StoreSemantics) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    let concat = matches!(semantics, StoreSemantics::Append | StoreSemantics::Prepend);
    let expected_extlen = if concat { 0 } else { 8 };
    if header.extlen != expected_extlen || header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, value, flags, expiry) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        let (flags, expiry) = if concat {
            (0, 0)
        } else {
            (
                u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
                u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]),
            )
        };
        (
            packet_key(&header, packet).to_vec(),
            Bytes::copy_from_slice(packet_value(&header, packet)),
            flags,
            expiry,
        )
    };

    let item = Item::new(value, flags, header.datatype, expiry);
    match engine.store(
        &conn.engine_cookie(),
        &key,
        header.vbucket,
        item,
        header.cas,
        semantics,
    ) {
        Ok(result) => {
            let extras = mutation_extras(conn, &result);
            conn.send_response(Status::Success, &extras, &[], &[], datatype::RAW, result.cas);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn set_executor(conn: &mut Connection) {
    store_impl(conn, StoreSemantics::Set);
}

pub fn add_executor(conn: &mut Connection) {
    store_impl(conn, StoreSemantics::Add);
}

pub fn replace_executor(conn: &mut Connection) {
    store_impl(conn, StoreSemantics::Replace);
}

pub fn append_executor(conn: &mut Connection) {
    store_impl(conn, StoreSemantics::Append);
}

pub fn prepend_executor(conn: &mut Connection) {
    store_impl(conn, StoreSemantics::Prepend);
}

pub fn delete_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if header.extlen != 0 || header.keylen == 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let key = packet_key(&header, conn.packet()).to_vec();
    match engine.remove(&conn.engine_cookie(), &key, header.vbucket, header.cas) {
        Ok(result) => {
            let extras = mutation_extras(conn, &result);
            conn.send_response(Status::Success, &extras, &[], &[], datatype::RAW, result.cas);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

fn arithmetic_impl(conn: &mut Connection, increment: bool) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if header.extlen != 20 || header.keylen == 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, delta, initial, expiry) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        let delta = u64::from_be_bytes([
            extras[0], extras[1], extras[2], extras[3], extras[4], extras[5], extras[6], extras[7],
        ]);
        let initial = u64::from_be_bytes([
            extras[8], extras[9], extras[10], extras[11], extras[12], extras[13], extras[14],
            extras[15],
        ]);
        let expiry = u32::from_be_bytes([extras[16], extras[17], extras[18], extras[19]]);
        (packet_key(&header, packet).to_vec(), delta, initial, expiry)
    };

    let create = expiry != ARITHMETIC_NO_CREATE;
    let expiry = if create { expiry } else { 0 };

    match engine.arithmetic(
        &conn.engine_cookie(),
        &key,
        header.vbucket,
        delta,
        initial,
        create,
        increment,
        expiry,
    ) {
        Ok((value, result)) => {
            let extras = mutation_extras(conn, &result);
            let body = value.to_be_bytes();
            conn.send_response(
                Status::Success,
                &extras,
                &[],
                &body,
                datatype::RAW,
                result.cas,
            );
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn increment_executor(conn: &mut Connection) {
    arithmetic_impl(conn, true);
}

pub fn decrement_executor(conn: &mut Connection) {
    arithmetic_impl(conn, false);
}

fn touch_impl(conn: &mut Connection, return_value: bool) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if header.extlen != 4 || header.keylen == 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, expiry) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        let expiry = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
        (packet_key(&header, packet).to_vec(), expiry)
    };

    match engine.get_and_touch(&conn.engine_cookie(), &key, header.vbucket, expiry) {
        Ok(item) => {
            if return_value {
                let extras = item.flags.to_be_bytes();
                conn.send_item_response(&extras, &[], item.value, item.datatype, item.cas);
            } else {
                conn.send_response(Status::Success, &[], &[], &[], datatype::RAW, item.cas);
            }
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn touch_executor(conn: &mut Connection) {
    touch_impl(conn, false);
}

pub fn gat_executor(conn: &mut Connection) {
    touch_impl(conn, true);
}

pub fn get_locked_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if (header.extlen != 0 && header.extlen != 4) || header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let (key, timeout) = {
        let packet = conn.packet();
        let timeout = if header.extlen == 4 {
            let extras = packet_extras(&header, packet);
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
        } else {
            0
        };
        (packet_key(&header, packet).to_vec(), timeout)
    };

    match engine.get_locked(&conn.engine_cookie(), &key, header.vbucket, timeout) {
        Ok(item) => {
            let extras = item.flags.to_be_bytes();
            conn.send_item_response(&extras, &[], item.value, item.datatype, item.cas);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn unlock_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if header.extlen != 0 || header.keylen == 0 || header.cas == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let key = packet_key(&header, conn.packet()).to_vec();
    match engine.unlock(&conn.engine_cookie(), &key, header.vbucket, header.cas) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn flush_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = copied_header(conn);
    if (header.extlen != 0 && header.extlen != 4) || header.keylen != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    match engine.flush(&conn.engine_cookie()) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}
