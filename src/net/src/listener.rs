// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::stream::Stream;
use crate::tls::TlsAcceptor;

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};

use std::io::Result;
use std::net::SocketAddr;

/// Accepts connections, wrapping each accepted socket as a plaintext or TLS
/// stream depending on whether an acceptor was provided.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub fn accept(&mut self) -> Result<Stream> {
        let (stream, _addr) = self.inner.accept()?;
        match &self.tls {
            Some(acceptor) => Ok(Stream::from(acceptor.accept(stream)?)),
            None => Ok(Stream::from(stream)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl From<TcpListener> for Listener {
    fn from(inner: TcpListener) -> Self {
        Self { inner, tls: None }
    }
}

impl From<(TcpListener, TlsAcceptor)> for Listener {
    fn from(parts: (TcpListener, TlsAcceptor)) -> Self {
        Self {
            inner: parts.0,
            tls: Some(parts.1),
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.inner.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.inner.deregister(registry)
    }
}
