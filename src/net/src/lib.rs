// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Wrappers which unify plaintext TCP and TLS/TCP streams behind a single
//! non-blocking `Stream` type, plus a `Listener` that accepts either kind.
//! Everything rides on top of mio's readiness notification.

pub use mio::net::{TcpListener, TcpStream};
pub use mio::*;

pub mod event {
    pub use mio::event::*;
}

mod listener;
mod stream;
mod tls;

pub use listener::Listener;
pub use stream::Stream;
pub use tls::{TlsAcceptor, TlsTcpStream};
