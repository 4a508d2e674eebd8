// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use engine::EngineError;
use protocol_mcbp::Status;

/// Translate an engine domain error to its wire status. Transient codes
/// (`WouldBlock`, `WantMore`) and `Disconnect` must be handled before this
/// point; mapping them is a programming error and falls back to EINTERNAL.
pub fn engine_error_status(error: EngineError) -> Status {
    match error {
        EngineError::KeyNotFound => Status::KeyEnoent,
        EngineError::KeyExists => Status::KeyEexists,
        EngineError::TooBig => Status::E2big,
        EngineError::InvalidArguments => Status::Einval,
        EngineError::NotStored => Status::NotStored,
        EngineError::DeltaBadval => Status::DeltaBadval,
        EngineError::NotMyVbucket => Status::NotMyVbucket,
        EngineError::NoBucket => Status::NoBucket,
        EngineError::Locked => Status::Locked,
        EngineError::OutOfMemory => Status::Enomem,
        EngineError::NotSupported => Status::NotSupported,
        EngineError::Busy => Status::Ebusy,
        EngineError::TemporaryFailure => Status::Etmpfail,
        EngineError::Range => Status::Erange,
        EngineError::Rollback => Status::Rollback,
        EngineError::AccessDenied => Status::Eaccess,
        EngineError::UnknownCollection => Status::UnknownCollection,
        EngineError::UnknownCommand => Status::UnknownCommand,
        EngineError::WouldBlock
        | EngineError::WantMore
        | EngineError::Disconnect
        | EngineError::Internal => Status::Einternal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_mapping() {
        assert_eq!(
            engine_error_status(EngineError::KeyNotFound),
            Status::KeyEnoent
        );
        assert_eq!(engine_error_status(EngineError::Locked), Status::Locked);
        assert_eq!(
            engine_error_status(EngineError::UnknownCollection),
            Status::UnknownCollection
        );
    }
}
