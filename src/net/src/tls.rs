// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::{ServerConfig, ServerConnection};

use std::io::{Error, ErrorKind, IoSlice, Read, Result, Write};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Produces server-side TLS sessions for accepted TCP streams.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn accept(&self, stream: TcpStream) -> Result<TlsTcpStream> {
        let session = ServerConnection::new(self.config.clone())
            .map_err(|e| Error::new(ErrorKind::Other, e))?;
        Ok(TlsTcpStream { stream, session })
    }
}

/// A TLS session over a non-blocking TCP stream. Reads pull ciphertext from
/// the socket on demand; writes buffer plaintext into the session and flush
/// ciphertext opportunistically, with `flush()` finishing the job when the
/// socket backs up.
pub struct TlsTcpStream {
    stream: TcpStream,
    session: ServerConnection,
}

impl TlsTcpStream {
    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    pub fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    pub fn interest(&self) -> Interest {
        if self.session.is_handshaking() || self.session.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// Drive the handshake forward. `WouldBlock` indicates the handshake is
    /// still in progress and needs another readiness event.
    pub fn do_handshake(&mut self) -> Result<()> {
        if self.session.is_handshaking() {
            self.session.complete_io(&mut self.stream)?;
        }
        if self.session.is_handshaking() {
            Err(Error::new(ErrorKind::WouldBlock, "handshake in progress"))
        } else {
            Ok(())
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

impl AsRawFd for TlsTcpStream {
    fn as_raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }
}

impl Read for TlsTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.session.is_handshaking() {
            self.session.complete_io(&mut self.stream)?;
            if self.session.is_handshaking() {
                return Err(Error::new(ErrorKind::WouldBlock, "handshake in progress"));
            }
        }

        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // no plaintext buffered, pull ciphertext from the socket
                    match self.session.read_tls(&mut self.stream) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            self.session
                                .process_new_packets()
                                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for TlsTcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.session.is_handshaking() {
            self.session.complete_io(&mut self.stream)?;
            if self.session.is_handshaking() {
                return Err(Error::new(ErrorKind::WouldBlock, "handshake in progress"));
            }
        }

        let n = self.session.writer().write(buf)?;

        // opportunistically move ciphertext to the socket; leftovers are
        // flushed later when the socket becomes writable
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(n)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        for buf in bufs {
            if !buf.is_empty() {
                return self.write(buf);
            }
        }
        Ok(0)
    }

    fn flush(&mut self) -> Result<()> {
        while self.session.wants_write() {
            self.session.write_tls(&mut self.stream)?;
        }
        Ok(())
    }
}

impl Source for TlsTcpStream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.stream.register(registry, token, interest)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        self.stream.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        self.stream.deregister(registry)
    }
}
