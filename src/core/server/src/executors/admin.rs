// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Executors for the administrative and observability commands.

use super::require_engine;
use crate::connection::Connection;

use engine::EngineError;
use protocol_mcbp::{
    datatype, packet_extras, packet_key, packet_value, ResponseHeader, Status,
};


/// Append one stat response packet to the dynamic buffer.
fn append_stat(buffer: &mut Vec<u8>, opcode: u8, opaque: u32, key: &str, value: &str) {
    let header = ResponseHeader {
        opcode,
        keylen: key.len() as u16,
        extlen: 0,
        datatype: datatype::RAW,
        status: Status::Success,
        bodylen: (key.len() + value.len()) as u32,
        opaque,
        cas: 0,
    };
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(key.as_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

/// STAT returns a sequence of key/value packets terminated by an empty one,
/// assembled in the cookie's dynamic buffer and sent in one pass.
pub fn stat_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let key = packet_key(&header, conn.packet()).to_vec();

    let mut pairs: Vec<(String, String)> = Vec::new();

    if key == b"connections" {
        for info in conn.shared.connections.snapshot() {
            pairs.push((
                format!("conn_{}", info.id),
                format!(
                    r#"{{"id":{},"peer":"{}","bucket":"{}"}}"#,
                    info.id, info.peer, info.bucket
                ),
            ));
        }
    } else {
        let result = engine.stats(&conn.engine_cookie(), &key, &mut |name, value| {
            pairs.push((name.to_string(), value.to_string()));
        });
        if let Err(e) = result {
            conn.respond_engine_error(e);
            return;
        }

        if key.is_empty() {
            pairs.push((
                "curr_connections".to_string(),
                conn.shared.connections.len().to_string(),
            ));
            pairs.push(("bucket".to_string(), conn.bucket_name().to_string()));
        }
    }

    {
        let buffer = conn.cookie.dynamic_buffer();
        for (name, value) in &pairs {
            append_stat(buffer, header.opcode, header.opaque, name, value);
        }
        // the terminator: an empty key and value
        append_stat(buffer, header.opcode, header.opaque, "", "");
    }

    conn.send_dynamic_buffer();
}

pub fn audit_put_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 4 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    let (id, payload) = {
        let packet = conn.packet();
        let extras = packet_extras(&header, packet);
        (
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            String::from_utf8_lossy(packet_value(&header, packet)).into_owned(),
        )
    };

    info!("audit event {}: {}", id, payload);
    conn.send_response_status(Status::Success);
}

pub fn config_reload_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    info!(
        "{}: configuration reload requested by {}",
        conn.id(),
        conn.description()
    );
    conn.send_response_status(Status::Success);
}

pub fn select_bucket_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 0 || header.keylen == 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    let name = String::from_utf8_lossy(packet_key(&header, conn.packet())).into_owned();
    match conn.shared.buckets.get(&name) {
        Some(engine) => {
            conn.bind_bucket(&name, engine);
            conn.send_response_status(Status::Success);
        }
        None => {
            conn.respond_engine_error(EngineError::KeyNotFound);
        }
    }
}

pub fn get_error_map_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    // a minimal but well-formed error map; per-code metadata is served by
    // the cluster manager
    let body = br#"{"version":1,"revision":1,"errors":{}}"#;
    conn.send_response(Status::Success, &[], &[], body, datatype::JSON, 0);
}

pub fn drop_privilege_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    let name = String::from_utf8_lossy(packet_key(&header, conn.packet())).into_owned();
    if conn.drop_privilege(&name) {
        conn.send_response_status(Status::Success);
    } else {
        conn.respond_engine_error(EngineError::KeyNotFound);
    }
}

pub fn observe_seqno_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 0 || header.keylen != 0 || header.value_len() != 8 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let uuid = {
        let value = packet_value(&header, conn.packet());
        u64::from_be_bytes([
            value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
        ])
    };

    match engine.observe_seqno(&conn.engine_cookie(), header.vbucket, uuid) {
        Ok(state) => {
            let mut body = Vec::with_capacity(27);
            body.push(0); // format: no failover
            body.extend_from_slice(&header.vbucket.to_be_bytes());
            body.extend_from_slice(&state.vbucket_uuid.to_be_bytes());
            body.extend_from_slice(&state.last_persisted_seqno.to_be_bytes());
            body.extend_from_slice(&state.current_seqno.to_be_bytes());
            conn.send_response(Status::Success, &[], &[], &body, datatype::RAW, 0);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn seqno_persistence_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 8 || header.keylen != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let seqno = {
        let extras = packet_extras(&header, conn.packet());
        u64::from_be_bytes([
            extras[0], extras[1], extras[2], extras[3], extras[4], extras[5], extras[6], extras[7],
        ])
    };

    match engine.seqno_persistence(&conn.engine_cookie(), header.vbucket, seqno) {
        Ok(()) => conn.send_response_status(Status::Success),
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

    match engine.get_failover_log(&conn.engine_cookie(), header.vbucket) {
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
