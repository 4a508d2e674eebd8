// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::require_engine;
use crate::connection::Connection;

use engine::EngineError;
use protocol_mcbp::{datatype, packet_key, packet_value, Status};

pub fn set_manifest_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 0 || header.keylen != 0 || header.value_len() == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let manifest = packet_value(&header, conn.packet()).to_vec();
    match engine.set_collections_manifest(&conn.engine_cookie(), &manifest) {
        Ok(()) => conn.send_response_status(Status::Success),
        Err(e) => conn.respond_engine_error(e),
    }
}

pub fn get_manifest_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    match engine.get_collections_manifest(&conn.engine_cookie()) {
        Ok(manifest) => {
            conn.send_item_response(&[], &[], manifest, datatype::JSON, 0);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

/// Resolve a `scope.collection` path to its id. The path travels in the key
/// (older clients) or the value.
pub fn get_collection_id_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    let engine = match require_engine(conn) {
        Some(engine) => engine,
        None => return,
    };

    let path = {
        let packet = conn.packet();
        let raw = if header.keylen > 0 {
            packet_key(&header, packet)
        } else {
            packet_value(&header, packet)
        };
        String::from_utf8_lossy(raw).into_owned()
    };
    if path.is_empty() {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    match engine.get_collection_id(&conn.engine_cookie(), &path) {
        Ok((manifest_uid, collection_id)) => {
            let mut extras = Vec::with_capacity(12);
            extras.extend_from_slice(&manifest_uid.to_be_bytes());
            extras.extend_from_slice(&collection_id.to_be_bytes());
            conn.send_response(Status::Success, &extras, &[], &[], datatype::RAW, 0);
        }
        Err(e) => conn.respond_engine_error(e),
    }
}
