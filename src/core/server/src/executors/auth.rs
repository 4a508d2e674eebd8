// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::connection::Connection;
use crate::sasl::{SaslOutcome, MECHANISMS};

use engine::EngineError;
use protocol_mcbp::{datatype, packet_key, packet_value, Status};

counter!(AUTH_CMDS, "authentication attempts");
counter!(AUTH_ERRORS, "authentication failures");

pub fn sasl_list_mechs_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }
    conn.send_response(
        Status::Success,
        &[],
        &[],
        MECHANISMS.as_bytes(),
        datatype::RAW,
        0,
    );
}

fn auth_impl(conn: &mut Connection, initial: bool) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let header = *conn.cookie.header().expect("executor requires a header");
    if header.extlen != 0 || header.keylen == 0 {
        conn.respond_engine_error(EngineError::InvalidArguments);
        return;
    }

    AUTH_CMDS.increment();

    let (mechanism, data) = {
        let packet = conn.packet();
        (
            String::from_utf8_lossy(packet_key(&header, packet)).into_owned(),
            packet_value(&header, packet).to_vec(),
        )
    };

    let outcome = if initial {
        conn.shared.authenticator.start(&mechanism, &data)
    } else {
        conn.shared.authenticator.step(&mechanism, &data)
    };

    match outcome {
        SaslOutcome::Ok { username } => {
            info!("{}: client {} authenticated as {}", conn.id(), conn.description(), username);
            conn.set_authenticated(Some(username));
            conn.send_response_status(Status::Success);
        }
        SaslOutcome::Continue => {
            conn.send_response_status(Status::AuthContinue);
        }
        SaslOutcome::Failed => {
            AUTH_ERRORS.increment();
            conn.set_authenticated(None);
            if conn.features.xerror {
                conn.cookie
                    .set_error_context("Authentication failed".to_string());
            }
            conn.send_response_status(Status::AuthError);
        }
    }
}

pub fn sasl_auth_executor(conn: &mut Connection) {
    auth_impl(conn, true);
}

pub fn sasl_step_executor(conn: &mut Connection) {
    auth_impl(conn, false);
}
