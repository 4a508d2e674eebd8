// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Opcode dispatch. The table is a static array indexed by the raw opcode
//! byte, so lookup is a single load and the table itself can be checked in
//! tests. Executors follow a common contract: fetch-and-clear the async
//! status, run or resume the command, and either frame a response, set the
//! would-block flag, or push the connection into `closing`.

mod admin;
mod auth;
mod collections;
mod dcp;
mod hello;
mod kv;
mod subdoc;

pub(crate) use dcp::ship_dcp_log;

use crate::connection::Connection;

use engine::EngineError;
use protocol_mcbp::{ClientOpcode, Status};

pub type Executor = fn(&mut Connection);

/// The engine handle for the connection's bucket, or a NoBucket response.
pub(crate) fn require_engine(
    conn: &mut Connection,
) -> Option<std::sync::Arc<dyn engine::Engine>> {
    match conn.engine() {
        Some(engine) => Some(engine),
        None => {
            conn.respond_engine_error(EngineError::NoBucket);
            None
        }
    }
}

const fn dispatch_table() -> [Option<Executor>; 256] {
    let mut table: [Option<Executor>; 256] = [None; 256];

    table[ClientOpcode::Get as usize] = Some(kv::get_executor as Executor);
    table[ClientOpcode::GetK as usize] = Some(kv::getk_executor as Executor);
    table[ClientOpcode::Set as usize] = Some(kv::set_executor as Executor);
    table[ClientOpcode::Add as usize] = Some(kv::add_executor as Executor);
    table[ClientOpcode::Replace as usize] = Some(kv::replace_executor as Executor);
    table[ClientOpcode::Delete as usize] = Some(kv::delete_executor as Executor);
    table[ClientOpcode::Append as usize] = Some(kv::append_executor as Executor);
    table[ClientOpcode::Prepend as usize] = Some(kv::prepend_executor as Executor);
    table[ClientOpcode::Increment as usize] = Some(kv::increment_executor as Executor);
    table[ClientOpcode::Decrement as usize] = Some(kv::decrement_executor as Executor);
    table[ClientOpcode::Touch as usize] = Some(kv::touch_executor as Executor);
    table[ClientOpcode::Gat as usize] = Some(kv::gat_executor as Executor);
    table[ClientOpcode::GetLocked as usize] = Some(kv::get_locked_executor as Executor);
    table[ClientOpcode::UnlockKey as usize] = Some(kv::unlock_executor as Executor);
    table[ClientOpcode::Flush as usize] = Some(kv::flush_executor as Executor);

    table[ClientOpcode::Noop as usize] = Some(hello::noop_executor as Executor);
    table[ClientOpcode::Version as usize] = Some(hello::version_executor as Executor);
    table[ClientOpcode::Quit as usize] = Some(hello::quit_executor as Executor);
    table[ClientOpcode::Hello as usize] = Some(hello::hello_executor as Executor);
    table[ClientOpcode::Verbosity as usize] = Some(hello::verbosity_executor as Executor);

    table[ClientOpcode::SaslListMechs as usize] = Some(auth::sasl_list_mechs_executor as Executor);
    table[ClientOpcode::SaslAuth as usize] = Some(auth::sasl_auth_executor as Executor);
    table[ClientOpcode::SaslStep as usize] = Some(auth::sasl_step_executor as Executor);

    table[ClientOpcode::Stat as usize] = Some(admin::stat_executor as Executor);
    table[ClientOpcode::AuditPut as usize] = Some(admin::audit_put_executor as Executor);
    table[ClientOpcode::ConfigReload as usize] = Some(admin::config_reload_executor as Executor);
    table[ClientOpcode::SelectBucket as usize] = Some(admin::select_bucket_executor as Executor);
    table[ClientOpcode::GetErrorMap as usize] = Some(admin::get_error_map_executor as Executor);
    table[ClientOpcode::DropPrivilege as usize] = Some(admin::drop_privilege_executor as Executor);
    table[ClientOpcode::ObserveSeqno as usize] = Some(admin::observe_seqno_executor as Executor);
    table[ClientOpcode::SeqnoPersistence as usize] =
        Some(admin::seqno_persistence_executor as Executor);
    table[ClientOpcode::GetFailoverLog as usize] =
        Some(admin::get_failover_log_executor as Executor);

    table[ClientOpcode::CollectionsSetManifest as usize] =
        Some(collections::set_manifest_executor as Executor);
    table[ClientOpcode::CollectionsGetManifest as usize] =
        Some(collections::get_manifest_executor as Executor);
    table[ClientOpcode::CollectionsGetId as usize] =
        Some(collections::get_collection_id_executor as Executor);

    table[ClientOpcode::SubdocGet as usize] = Some(subdoc::get_executor as Executor);
    table[ClientOpcode::SubdocExists as usize] = Some(subdoc::exists_executor as Executor);
    table[ClientOpcode::SubdocGetCount as usize] = Some(subdoc::get_count_executor as Executor);
    table[ClientOpcode::SubdocDictAdd as usize] = Some(subdoc::dict_add_executor as Executor);
    table[ClientOpcode::SubdocDictUpsert as usize] =
        Some(subdoc::dict_upsert_executor as Executor);
    table[ClientOpcode::SubdocDelete as usize] = Some(subdoc::delete_executor as Executor);
    table[ClientOpcode::SubdocReplace as usize] = Some(subdoc::replace_executor as Executor);
    table[ClientOpcode::SubdocCounter as usize] = Some(subdoc::counter_executor as Executor);
    table[ClientOpcode::SubdocArrayPushLast as usize] =
        Some(subdoc::unsupported_executor as Executor);
    table[ClientOpcode::SubdocArrayPushFirst as usize] =
        Some(subdoc::unsupported_executor as Executor);
    table[ClientOpcode::SubdocArrayInsert as usize] =
        Some(subdoc::unsupported_executor as Executor);
    table[ClientOpcode::SubdocArrayAddUnique as usize] =
        Some(subdoc::unsupported_executor as Executor);
    table[ClientOpcode::SubdocMultiLookup as usize] =
        Some(subdoc::unsupported_executor as Executor);
    table[ClientOpcode::SubdocMultiMutation as usize] =
        Some(subdoc::unsupported_executor as Executor);

    table[ClientOpcode::DcpOpen as usize] = Some(dcp::open_executor as Executor);
    table[ClientOpcode::DcpAddStream as usize] = Some(dcp::add_stream_executor as Executor);
    table[ClientOpcode::DcpCloseStream as usize] = Some(dcp::close_stream_executor as Executor);
    table[ClientOpcode::DcpStreamReq as usize] = Some(dcp::stream_req_executor as Executor);
    table[ClientOpcode::DcpGetFailoverLog as usize] =
        Some(dcp::get_failover_log_executor as Executor);
    table[ClientOpcode::DcpStreamEnd as usize] = Some(dcp::stream_end_executor as Executor);
    table[ClientOpcode::DcpSnapshotMarker as usize] =
        Some(dcp::snapshot_marker_executor as Executor);
    table[ClientOpcode::DcpMutation as usize] = Some(dcp::mutation_executor as Executor);
    table[ClientOpcode::DcpDeletion as usize] = Some(dcp::deletion_executor as Executor);
    table[ClientOpcode::DcpExpiration as usize] = Some(dcp::expiration_executor as Executor);
    table[ClientOpcode::DcpFlush as usize] = Some(dcp::flush_executor as Executor);
    table[ClientOpcode::DcpSetVbucketState as usize] =
        Some(dcp::set_vbucket_state_executor as Executor);
    table[ClientOpcode::DcpNoop as usize] = Some(dcp::noop_executor as Executor);
    table[ClientOpcode::DcpBufferAcknowledgement as usize] =
        Some(dcp::buffer_ack_executor as Executor);
    table[ClientOpcode::DcpControl as usize] = Some(dcp::control_executor as Executor);

    table
}

/// The opcode dispatch table.
pub static EXECUTORS: [Option<Executor>; 256] = dispatch_table();

/// Execute the packet held by the connection's cookie.
pub fn execute_packet(conn: &mut Connection) {
    let opcode = conn
        .cookie
        .header()
        .expect("execute requires a parsed header")
        .opcode;

    match EXECUTORS[opcode as usize] {
        Some(executor) => executor(conn),
        None => unknown_command_executor(conn),
    }
}

/// Route opcodes without a native executor to the engine's unknown-command
/// hook so engines can expose their own commands.
fn unknown_command_executor(conn: &mut Connection) {
    if let Err(e) = conn.take_aiostat() {
        conn.respond_engine_error(e);
        return;
    }

    let engine = match conn.engine() {
        Some(engine) => engine,
        None => {
            conn.respond_engine_error(EngineError::UnknownCommand);
            return;
        }
    };

    let packet = conn.packet().to_vec();
    match engine.unknown_command(&conn.engine_cookie(), &packet) {
        Ok(raw) => {
            let status = Status::from_u16(raw.status).unwrap_or(Status::Einternal);
            match conn.remap_error(status) {
                Some(status) => conn.send_raw_response(
                    status,
                    &raw.extras,
                    &raw.key,
                    &raw.value,
                    raw.datatype,
                    raw.cas,
                ),
                None => conn.set_state(crate::State::Closing),
            }
        }
        Err(e) => conn.respond_engine_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // the table is data; make sure the surface we promise is wired up
    fn table_coverage() {
        let wired = [
            ClientOpcode::Get,
            ClientOpcode::Set,
            ClientOpcode::Delete,
            ClientOpcode::Add,
            ClientOpcode::Replace,
            ClientOpcode::Append,
            ClientOpcode::Prepend,
            ClientOpcode::Increment,
            ClientOpcode::Decrement,
            ClientOpcode::Flush,
            ClientOpcode::Stat,
            ClientOpcode::Touch,
            ClientOpcode::Gat,
            ClientOpcode::SaslAuth,
            ClientOpcode::SaslStep,
            ClientOpcode::SaslListMechs,
            ClientOpcode::Hello,
            ClientOpcode::SelectBucket,
            ClientOpcode::DcpOpen,
            ClientOpcode::DcpAddStream,
            ClientOpcode::DcpCloseStream,
            ClientOpcode::DcpStreamReq,
            ClientOpcode::DcpGetFailoverLog,
            ClientOpcode::DcpStreamEnd,
            ClientOpcode::DcpSnapshotMarker,
            ClientOpcode::DcpMutation,
            ClientOpcode::DcpDeletion,
            ClientOpcode::DcpExpiration,
            ClientOpcode::DcpFlush,
            ClientOpcode::DcpSetVbucketState,
            ClientOpcode::DcpNoop,
            ClientOpcode::DcpBufferAcknowledgement,
            ClientOpcode::DcpControl,
            ClientOpcode::SubdocGet,
            ClientOpcode::SubdocDictUpsert,
            ClientOpcode::CollectionsSetManifest,
            ClientOpcode::CollectionsGetManifest,
            ClientOpcode::CollectionsGetId,
            ClientOpcode::AuditPut,
            ClientOpcode::ConfigReload,
            ClientOpcode::ObserveSeqno,
            ClientOpcode::SeqnoPersistence,
            ClientOpcode::DropPrivilege,
        ];
        for opcode in wired {
            assert!(
                EXECUTORS[opcode as usize].is_some(),
                "no executor for {}",
                opcode
            );
        }
    }

    #[test]
    fn unwired_opcodes_are_empty() {
        // 0x09 is GETQ, which this core does not implement
        assert!(EXECUTORS[0x09].is_none());
        assert!(EXECUTORS[0xff].is_none());
    }
}
