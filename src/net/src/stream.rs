// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::tls::TlsTcpStream;

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use std::io::{IoSlice, Read, Result, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// A wrapper type that unifies plaintext TCP streams and TLS/TCP streams, so
/// that TLS may be enabled through configuration without changing the types
/// the connection layer works with.
pub struct Stream {
    inner: StreamType,
}

/// Concrete stream variants. The number of variants is small, so dispatch
/// through the enum is cheaper than a trait object.
enum StreamType {
    Tcp(TcpStream),
    TlsTcp(TlsTcpStream),
}

impl Stream {
    /// The event interest this stream needs right now. TLS streams ask for
    /// write readiness while a handshake or a buffered ciphertext flush is
    /// outstanding.
    pub fn interest(&self) -> Interest {
        match &self.inner {
            StreamType::Tcp(_) => Interest::READABLE,
            StreamType::TlsTcp(s) => s.interest(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamType::TlsTcp(_))
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(_) => false,
            StreamType::TlsTcp(s) => s.is_handshaking(),
        }
    }

    /// Drive any in-progress TLS handshake. Returns `WouldBlock` while the
    /// handshake needs more I/O; a no-op for plaintext streams.
    pub fn do_handshake(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(_) => Ok(()),
            StreamType::TlsTcp(s) => s.do_handshake(),
        }
    }

    /// True when the stream holds buffered bytes that have not reached the
    /// socket yet and wants a write event to finish flushing.
    pub fn wants_flush(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(_) => false,
            StreamType::TlsTcp(s) => s.wants_write(),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            StreamType::Tcp(s) => s.peer_addr(),
            StreamType::TlsTcp(s) => s.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            StreamType::Tcp(s) => s.local_addr(),
            StreamType::TlsTcp(s) => s.local_addr(),
        }
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.set_nodelay(nodelay),
            StreamType::TlsTcp(s) => s.set_nodelay(nodelay),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> i32 {
        match &self.inner {
            StreamType::Tcp(s) => s.as_raw_fd(),
            StreamType::TlsTcp(s) => s.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.peer_addr(), self.local_addr()) {
            (Ok(peer), Ok(local)) => write!(f, "{} - {}", peer, local),
            _ => write!(f, "(disconnected)"),
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(other: TcpStream) -> Self {
        Self {
            inner: StreamType::Tcp(other),
        }
    }
}

impl From<TlsTcpStream> for Stream {
    fn from(other: TlsTcpStream) -> Self {
        Self {
            inner: StreamType::TlsTcp(other),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.read(buf),
            StreamType::TlsTcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.write(buf),
            StreamType::TlsTcp(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.write_vectored(bufs),
            StreamType::TlsTcp(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.flush(),
            StreamType::TlsTcp(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.register(registry, token, interest),
            StreamType::TlsTcp(s) => s.register(registry, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.reregister(registry, token, interest),
            StreamType::TlsTcp(s) => s.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.deregister(registry),
            StreamType::TlsTcp(s) => s.deregister(registry),
        }
    }
}
