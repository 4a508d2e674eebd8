// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A small blocking client for driving the daemon over a real socket in the
//! integration tests.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub const HEADER_LEN: usize = 24;

/// A parsed frame, request or response.
#[derive(Debug)]
pub struct Frame {
    pub magic: u8,
    pub opcode: u8,
    pub datatype: u8,
    /// status for responses, vbucket for requests
    pub status_or_vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Frame {
    pub fn status(&self) -> u16 {
        self.status_or_vbucket
    }
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("failed to connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("failed to set read timeout");
        stream.set_nodelay(true).expect("failed to set nodelay");
        Self { stream }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("failed to write");
    }

    /// Compose and send a client-request frame.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        opcode: u8,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) {
        let bodylen = (extras.len() + key.len() + value.len()) as u32;
        let mut frame = Vec::with_capacity(HEADER_LEN + bodylen as usize);
        frame.push(0x80);
        frame.push(opcode);
        frame.extend_from_slice(&(key.len() as u16).to_be_bytes());
        frame.push(extras.len() as u8);
        frame.push(0); // datatype
        frame.extend_from_slice(&vbucket.to_be_bytes());
        frame.extend_from_slice(&bodylen.to_be_bytes());
        frame.extend_from_slice(&opaque.to_be_bytes());
        frame.extend_from_slice(&cas.to_be_bytes());
        frame.extend_from_slice(extras);
        frame.extend_from_slice(key);
        frame.extend_from_slice(value);
        self.send_raw(&frame);
    }

    /// Read one frame off the wire, blocking up to the socket timeout.
    pub fn recv(&mut self) -> Frame {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .expect("failed to read frame header");

        let keylen = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extlen = header[4] as usize;
        let bodylen = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let mut body = vec![0u8; bodylen];
        self.stream
            .read_exact(&mut body)
            .expect("failed to read frame body");

        Frame {
            magic: header[0],
            opcode: header[1],
            datatype: header[5],
            status_or_vbucket: u16::from_be_bytes([header[6], header[7]]),
            opaque: u32::from_be_bytes([header[12], header[13], header[14], header[15]]),
            cas: u64::from_be_bytes([
                header[16], header[17], header[18], header[19], header[20], header[21],
                header[22], header[23],
            ]),
            extras: body[..extlen].to_vec(),
            key: body[extlen..extlen + keylen].to_vec(),
            value: body[extlen + keylen..].to_vec(),
        }
    }

    /// True once the server has closed the connection.
    pub fn eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }
}
