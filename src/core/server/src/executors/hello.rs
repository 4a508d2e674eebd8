// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! HELLO feature negotiation and the small housekeeping commands.

use crate::connection::Connection;
use crate::statemachine::State;

use engine::EngineError;
use protocol_mcbp::{datatype, packet_key, packet_value, Feature, Status};

pub fn noop_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    conn.send_response_status(Status::Success);
}

pub fn version_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    let version = conn.shared.version.clone();
    conn.send_response(
        Status::Success,
        &[],
        &[],
        version.as_bytes(),
        datatype::RAW,
        0,
    );
}

/// Respond and then close: the response must still be flushed, so the close
/// rides `write_and_go`.
pub fn quit_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    conn.send_response_status(Status::Success);
    conn.write_and_go = State::Closing;
}

pub fn verbosity_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 4 || header.keylen != 0 || header.value_len() != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }
    let level = {
        let extras = protocol_mcbp::packet_extras(&header, conn.packet());
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    };
    conn.set_verbosity(level);
    conn.send_response_status(Status::Success);
}

/// Apply one negotiated feature to the connection.
fn enable_feature(conn: &mut Connection, feature: Feature) {
    match feature {
        Feature::Json => conn.features.json = true,
        Feature::TcpNoDelay => {
            conn.features.tcp_nodelay = conn.set_tcp_nodelay(true);
        }
        Feature::MutationSeqno => conn.features.mutation_seqno = true,
        Feature::Xattr => conn.features.xattr = true,
        Feature::Xerror => conn.features.xerror = true,
        Feature::SelectBucket => conn.features.select_bucket = true,
        Feature::Snappy => conn.features.snappy = true,
        Feature::Duplex => conn.features.duplex = true,
        Feature::ClustermapChangeNotification => conn.features.clustermap_notify = true,
        Feature::UnorderedExecution => conn.features.unordered_execution = true,
        Feature::Tracing => conn.features.tracing = true,
        Feature::AltRequestSupport => conn.features.alt_request = true,
        Feature::Collections => conn.features.collections = true,
        Feature::DeleteTime => conn.features.delete_times = true,
    }
}

/// Whether a feature actually took effect (TCP_NODELAY can fail at the
/// socket level, in which case it must not be echoed).
fn feature_enabled(conn: &Connection, feature: Feature) -> bool {
    match feature {
        Feature::TcpNoDelay => conn.features.tcp_nodelay,
        _ => true,
    }
}

/// The HELLO key names the client. A plain string is the agent name; a JSON
/// object may carry `{"a": agent, "i": connection-id}`.
fn apply_client_identity(conn: &mut Connection, key: &[u8]) {
    if key.is_empty() {
        return;
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(key) {
        if let Some(object) = value.as_object() {
            if let Some(agent) = object.get("a").and_then(|v| v.as_str()) {
                conn.set_agent_name(agent);
            }
            if let Some(id) = object.get("i").and_then(|v| v.as_str()) {
                conn.set_connection_id(id);
            }
            return;
        }
    }

    conn.set_agent_name(&String::from_utf8_lossy(key));
}

pub fn hello_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 0 || header.value_len() % 2 != 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    let (key, requested) = {
        let packet = conn.packet();
        let key = packet_key(&header, packet).to_vec();
        let value = packet_value(&header, packet);
        let requested: Vec<u16> = value
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        (key, requested)
    };

    apply_client_identity(conn, &key);

    // echo the supported subset back in request order
    let mut echoed = Vec::with_capacity(requested.len() * 2);
    for id in requested {
        if let Some(feature) = Feature::from_u16(id) {
            enable_feature(conn, feature);
            if feature_enabled(conn, feature) {
                echoed.extend_from_slice(&id.to_be_bytes());
            }
        }
    }

    debug!(
        "{}: HELLO negotiated {} features for {}",
        conn.id(),
        echoed.len() / 2,
        conn.description()
    );

    conn.send_response(Status::Success, &[], &[], &echoed, datatype::RAW, 0);
}
