// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::fmt::{Display, Formatter};

/// Client opcodes understood by the core. Opcodes arriving on the wire which
/// do not map to a variant here are routed to the engine's unknown-command
/// hook before being rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOpcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    ConfigReload = 0x26,
    AuditPut = 0x27,
    DcpOpen = 0x50,
    DcpAddStream = 0x51,
    DcpCloseStream = 0x52,
    DcpStreamReq = 0x53,
    DcpGetFailoverLog = 0x54,
    DcpStreamEnd = 0x55,
    DcpSnapshotMarker = 0x56,
    DcpMutation = 0x57,
    DcpDeletion = 0x58,
    DcpExpiration = 0x59,
    DcpFlush = 0x5a,
    DcpSetVbucketState = 0x5b,
    DcpNoop = 0x5c,
    DcpBufferAcknowledgement = 0x5d,
    DcpControl = 0x5e,
    SelectBucket = 0x89,
    ObserveSeqno = 0x91,
    GetLocked = 0x94,
    UnlockKey = 0x95,
    GetFailoverLog = 0x96,
    SeqnoPersistence = 0xb8,
    CollectionsSetManifest = 0xb9,
    CollectionsGetManifest = 0xba,
    CollectionsGetId = 0xbb,
    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    SubdocGetCount = 0xd2,
    DropPrivilege = 0xfb,
    GetErrorMap = 0xfe,
}

impl ClientOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let opcode = match value {
            0x00 => ClientOpcode::Get,
            0x01 => ClientOpcode::Set,
            0x02 => ClientOpcode::Add,
            0x03 => ClientOpcode::Replace,
            0x04 => ClientOpcode::Delete,
            0x05 => ClientOpcode::Increment,
            0x06 => ClientOpcode::Decrement,
            0x07 => ClientOpcode::Quit,
            0x08 => ClientOpcode::Flush,
            0x0a => ClientOpcode::Noop,
            0x0b => ClientOpcode::Version,
            0x0c => ClientOpcode::GetK,
            0x0e => ClientOpcode::Append,
            0x0f => ClientOpcode::Prepend,
            0x10 => ClientOpcode::Stat,
            0x1b => ClientOpcode::Verbosity,
            0x1c => ClientOpcode::Touch,
            0x1d => ClientOpcode::Gat,
            0x1f => ClientOpcode::Hello,
            0x20 => ClientOpcode::SaslListMechs,
            0x21 => ClientOpcode::SaslAuth,
            0x22 => ClientOpcode::SaslStep,
            0x26 => ClientOpcode::ConfigReload,
            0x27 => ClientOpcode::AuditPut,
            0x50 => ClientOpcode::DcpOpen,
            0x51 => ClientOpcode::DcpAddStream,
            0x52 => ClientOpcode::DcpCloseStream,
            0x53 => ClientOpcode::DcpStreamReq,
            0x54 => ClientOpcode::DcpGetFailoverLog,
            0x55 => ClientOpcode::DcpStreamEnd,
            0x56 => ClientOpcode::DcpSnapshotMarker,
            0x57 => ClientOpcode::DcpMutation,
            0x58 => ClientOpcode::DcpDeletion,
            0x59 => ClientOpcode::DcpExpiration,
            0x5a => ClientOpcode::DcpFlush,
            0x5b => ClientOpcode::DcpSetVbucketState,
            0x5c => ClientOpcode::DcpNoop,
            0x5d => ClientOpcode::DcpBufferAcknowledgement,
            0x5e => ClientOpcode::DcpControl,
            0x89 => ClientOpcode::SelectBucket,
            0x91 => ClientOpcode::ObserveSeqno,
            0x94 => ClientOpcode::GetLocked,
            0x95 => ClientOpcode::UnlockKey,
            0x96 => ClientOpcode::GetFailoverLog,
            0xb8 => ClientOpcode::SeqnoPersistence,
            0xb9 => ClientOpcode::CollectionsSetManifest,
            0xba => ClientOpcode::CollectionsGetManifest,
            0xbb => ClientOpcode::CollectionsGetId,
            0xc5 => ClientOpcode::SubdocGet,
            0xc6 => ClientOpcode::SubdocExists,
            0xc7 => ClientOpcode::SubdocDictAdd,
            0xc8 => ClientOpcode::SubdocDictUpsert,
            0xc9 => ClientOpcode::SubdocDelete,
            0xca => ClientOpcode::SubdocReplace,
            0xcb => ClientOpcode::SubdocArrayPushLast,
            0xcc => ClientOpcode::SubdocArrayPushFirst,
            0xcd => ClientOpcode::SubdocArrayInsert,
            0xce => ClientOpcode::SubdocArrayAddUnique,
            0xcf => ClientOpcode::SubdocCounter,
            0xd0 => ClientOpcode::SubdocMultiLookup,
            0xd1 => ClientOpcode::SubdocMultiMutation,
            0xd2 => ClientOpcode::SubdocGetCount,
            0xfb => ClientOpcode::DropPrivilege,
            0xfe => ClientOpcode::GetErrorMap,
            _ => return None,
        };
        Some(opcode)
    }

    /// True for the DCP family, which rides the full-duplex path.
    pub fn is_dcp(self) -> bool {
        (self as u8) >= 0x50 && (self as u8) <= 0x5e
    }

    /// True for the sub-document family.
    pub fn is_subdoc(self) -> bool {
        (self as u8) >= 0xc5 && (self as u8) <= 0xd2
    }
}

impl Display for ClientOpcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ClientOpcode::Get => "GET",
            ClientOpcode::Set => "SET",
            ClientOpcode::Add => "ADD",
            ClientOpcode::Replace => "REPLACE",
            ClientOpcode::Delete => "DELETE",
            ClientOpcode::Increment => "INCREMENT",
            ClientOpcode::Decrement => "DECREMENT",
            ClientOpcode::Quit => "QUIT",
            ClientOpcode::Flush => "FLUSH",
            ClientOpcode::Noop => "NOOP",
            ClientOpcode::Version => "VERSION",
            ClientOpcode::GetK => "GETK",
            ClientOpcode::Append => "APPEND",
            ClientOpcode::Prepend => "PREPEND",
            ClientOpcode::Stat => "STAT",
            ClientOpcode::Verbosity => "VERBOSITY",
            ClientOpcode::Touch => "TOUCH",
            ClientOpcode::Gat => "GAT",
            ClientOpcode::Hello => "HELLO",
            ClientOpcode::SaslListMechs => "SASL_LIST_MECHS",
            ClientOpcode::SaslAuth => "SASL_AUTH",
            ClientOpcode::SaslStep => "SASL_STEP",
            ClientOpcode::ConfigReload => "CONFIG_RELOAD",
            ClientOpcode::AuditPut => "AUDIT_PUT",
            ClientOpcode::DcpOpen => "DCP_OPEN",
            ClientOpcode::DcpAddStream => "DCP_ADD_STREAM",
            ClientOpcode::DcpCloseStream => "DCP_CLOSE_STREAM",
            ClientOpcode::DcpStreamReq => "DCP_STREAM_REQ",
            ClientOpcode::DcpGetFailoverLog => "DCP_GET_FAILOVER_LOG",
            ClientOpcode::DcpStreamEnd => "DCP_STREAM_END",
            ClientOpcode::DcpSnapshotMarker => "DCP_SNAPSHOT_MARKER",
            ClientOpcode::DcpMutation => "DCP_MUTATION",
            ClientOpcode::DcpDeletion => "DCP_DELETION",
            ClientOpcode::DcpExpiration => "DCP_EXPIRATION",
            ClientOpcode::DcpFlush => "DCP_FLUSH",
            ClientOpcode::DcpSetVbucketState => "DCP_SET_VBUCKET_STATE",
            ClientOpcode::DcpNoop => "DCP_NOOP",
            ClientOpcode::DcpBufferAcknowledgement => "DCP_BUFFER_ACKNOWLEDGEMENT",
            ClientOpcode::DcpControl => "DCP_CONTROL",
            ClientOpcode::SelectBucket => "SELECT_BUCKET",
            ClientOpcode::ObserveSeqno => "OBSERVE_SEQNO",
            ClientOpcode::GetLocked => "GET_LOCKED",
            ClientOpcode::UnlockKey => "UNLOCK_KEY",
            ClientOpcode::GetFailoverLog => "GET_FAILOVER_LOG",
            ClientOpcode::SeqnoPersistence => "SEQNO_PERSISTENCE",
            ClientOpcode::CollectionsSetManifest => "COLLECTIONS_SET_MANIFEST",
            ClientOpcode::CollectionsGetManifest => "COLLECTIONS_GET_MANIFEST",
            ClientOpcode::CollectionsGetId => "COLLECTIONS_GET_ID",
            ClientOpcode::SubdocGet => "SUBDOC_GET",
            ClientOpcode::SubdocExists => "SUBDOC_EXISTS",
            ClientOpcode::SubdocDictAdd => "SUBDOC_DICT_ADD",
            ClientOpcode::SubdocDictUpsert => "SUBDOC_DICT_UPSERT",
            ClientOpcode::SubdocDelete => "SUBDOC_DELETE",
            ClientOpcode::SubdocReplace => "SUBDOC_REPLACE",
            ClientOpcode::SubdocArrayPushLast => "SUBDOC_ARRAY_PUSH_LAST",
            ClientOpcode::SubdocArrayPushFirst => "SUBDOC_ARRAY_PUSH_FIRST",
            ClientOpcode::SubdocArrayInsert => "SUBDOC_ARRAY_INSERT",
            ClientOpcode::SubdocArrayAddUnique => "SUBDOC_ARRAY_ADD_UNIQUE",
            ClientOpcode::SubdocCounter => "SUBDOC_COUNTER",
            ClientOpcode::SubdocMultiLookup => "SUBDOC_MULTI_LOOKUP",
            ClientOpcode::SubdocMultiMutation => "SUBDOC_MULTI_MUTATION",
            ClientOpcode::SubdocGetCount => "SUBDOC_GET_COUNT",
            ClientOpcode::DropPrivilege => "DROP_PRIVILEGE",
            ClientOpcode::GetErrorMap => "GET_ERROR_MAP",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for byte in 0..=255u8 {
            if let Some(opcode) = ClientOpcode::from_u8(byte) {
                assert_eq!(opcode as u8, byte);
            }
        }
    }

    #[test]
    fn families() {
        assert!(ClientOpcode::DcpMutation.is_dcp());
        assert!(!ClientOpcode::Get.is_dcp());
        assert!(ClientOpcode::SubdocGet.is_subdoc());
        assert!(!ClientOpcode::Hello.is_subdoc());
    }
}
