// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Response status codes. Codes past the original memcached set are only sent
/// to clients which negotiated XERROR; for everyone else the connection's
/// remap policy collapses them to a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    KeyEnoent = 0x0001,
    KeyEexists = 0x0002,
    E2big = 0x0003,
    Einval = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,
    NoBucket = 0x0008,
    Locked = 0x0009,
    AuthStale = 0x001f,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    Erange = 0x0022,
    Rollback = 0x0023,
    Eaccess = 0x0024,
    NotInitialized = 0x0025,
    UnknownCommand = 0x0081,
    Enomem = 0x0082,
    NotSupported = 0x0083,
    Einternal = 0x0084,
    Ebusy = 0x0085,
    Etmpfail = 0x0086,
    XattrEinval = 0x0087,
    UnknownCollection = 0x0088,
    SubdocPathEnoent = 0x00c0,
    SubdocPathMismatch = 0x00c1,
    SubdocPathEinval = 0x00c2,
    SubdocPathE2big = 0x00c3,
    SubdocDocE2deep = 0x00c4,
    SubdocValueCantinsert = 0x00c5,
    SubdocDocNotJson = 0x00c6,
    SubdocNumErange = 0x00c7,
    SubdocDeltaEinval = 0x00c8,
    SubdocPathEexists = 0x00c9,
    SubdocValueEtoodeep = 0x00ca,
}

impl Status {
    pub fn from_u16(value: u16) -> Option<Self> {
        let status = match value {
            0x0000 => Status::Success,
            0x0001 => Status::KeyEnoent,
            0x0002 => Status::KeyEexists,
            0x0003 => Status::E2big,
            0x0004 => Status::Einval,
            0x0005 => Status::NotStored,
            0x0006 => Status::DeltaBadval,
            0x0007 => Status::NotMyVbucket,
            0x0008 => Status::NoBucket,
            0x0009 => Status::Locked,
            0x001f => Status::AuthStale,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0022 => Status::Erange,
            0x0023 => Status::Rollback,
            0x0024 => Status::Eaccess,
            0x0025 => Status::NotInitialized,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::Enomem,
            0x0083 => Status::NotSupported,
            0x0084 => Status::Einternal,
            0x0085 => Status::Ebusy,
            0x0086 => Status::Etmpfail,
            0x0087 => Status::XattrEinval,
            0x0088 => Status::UnknownCollection,
            0x00c0 => Status::SubdocPathEnoent,
            0x00c1 => Status::SubdocPathMismatch,
            0x00c2 => Status::SubdocPathEinval,
            0x00c3 => Status::SubdocPathE2big,
            0x00c4 => Status::SubdocDocE2deep,
            0x00c5 => Status::SubdocValueCantinsert,
            0x00c6 => Status::SubdocDocNotJson,
            0x00c7 => Status::SubdocNumErange,
            0x00c8 => Status::SubdocDeltaEinval,
            0x00c9 => Status::SubdocPathEexists,
            0x00ca => Status::SubdocValueEtoodeep,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// True for codes which predate XERROR negotiation and are safe to send
    /// to any client.
    pub fn is_legacy(self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::KeyEnoent
                | Status::KeyEexists
                | Status::E2big
                | Status::Einval
                | Status::NotStored
                | Status::DeltaBadval
                | Status::NotMyVbucket
                | Status::NoBucket
                | Status::Locked
                | Status::AuthError
                | Status::AuthContinue
                | Status::UnknownCommand
                | Status::Enomem
                | Status::NotSupported
                | Status::Einternal
                | Status::Ebusy
                | Status::Etmpfail
        )
    }

    /// Extended codes require the client to have negotiated XERROR.
    pub fn is_extended(self) -> bool {
        !self.is_legacy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for value in 0..=0xffffu16 {
            if let Some(status) = Status::from_u16(value) {
                assert_eq!(status as u16, value);
            }
        }
    }

    #[test]
    fn xerror_gating() {
        assert!(Status::KeyEnoent.is_legacy());
        assert!(Status::Etmpfail.is_legacy());
        assert!(Status::UnknownCollection.is_extended());
        assert!(Status::SubdocPathEnoent.is_extended());
        assert!(Status::Eaccess.is_extended());
    }
}
