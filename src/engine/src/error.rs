// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Result codes from engine operations. The first three are transients and
/// control signals rather than errors: `WouldBlock` suspends the connection
/// until the engine notifies completion, `WantMore` asks for more input, and
/// `Disconnect` tells the core to drop the connection.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("operation would block")]
    WouldBlock,
    #[error("engine wants more data")]
    WantMore,
    #[error("engine requested disconnect")]
    Disconnect,

    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyExists,
    #[error("value too big")]
    TooBig,
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("item not stored")]
    NotStored,
    #[error("delta on non-numeric value")]
    DeltaBadval,
    #[error("vbucket not owned by this node")]
    NotMyVbucket,
    #[error("no bucket selected")]
    NoBucket,
    #[error("item is locked")]
    Locked,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not supported")]
    NotSupported,
    #[error("internal error")]
    Internal,
    #[error("engine busy")]
    Busy,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("out of range")]
    Range,
    #[error("rollback required")]
    Rollback,
    #[error("access denied")]
    AccessDenied,
    #[error("unknown collection")]
    UnknownCollection,
    #[error("unknown command")]
    UnknownCommand,
}

impl EngineError {
    /// Transient codes suspend or steer the state machine instead of being
    /// surfaced to the client as a response.
    pub fn is_transient(self) -> bool {
        matches!(self, EngineError::WouldBlock | EngineError::WantMore)
    }
}
