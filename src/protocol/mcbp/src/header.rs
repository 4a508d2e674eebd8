// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::{ClientOpcode, Magic, Status};

use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown magic: {0:#04x}")]
    UnknownMagic(u8),
    #[error("frame is not a request")]
    NotARequest,
    #[error("fewer than {} bytes available", HEADER_LEN)]
    PartialHeader,
    #[error("frame lengths are implausible")]
    ImplausibleLength,
}

/// A parsed request header. Fields are kept in host order; parsing and
/// serialisation perform the big-endian conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: Magic,
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Decode a header from the first 24 bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::PartialHeader);
        }

        let magic = Magic::from_u8(buf[0]).ok_or(ProtocolError::UnknownMagic(buf[0]))?;

        Ok(Self {
            magic,
            opcode: buf[1],
            keylen: u16::from_be_bytes([buf[2], buf[3]]),
            extlen: buf[4],
            datatype: buf[5],
            vbucket: u16::from_be_bytes([buf[6], buf[7]]),
            bodylen: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Check that the header describes a request the core could ever execute.
    /// Violations here are framing errors and fatal for the connection.
    pub fn validate(&self, max_packet_size: u32) -> Result<(), ProtocolError> {
        if !self.magic.is_request() {
            return Err(ProtocolError::NotARequest);
        }
        if self.keylen as u32 + self.extlen as u32 > self.bodylen {
            return Err(ProtocolError::ImplausibleLength);
        }
        if self.bodylen > max_packet_size {
            return Err(ProtocolError::ImplausibleLength);
        }
        Ok(())
    }

    pub fn opcode(&self) -> Option<ClientOpcode> {
        ClientOpcode::from_u8(self.opcode)
    }

    /// Total frame length including the header.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.bodylen as usize
    }

    /// Serialise the header, used when the daemon originates requests of its
    /// own (the outbound change-feed messages).
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[0] = self.magic as u8;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.keylen.to_be_bytes());
        buf[4] = self.extlen;
        buf[5] = self.datatype;
        buf[6..8].copy_from_slice(&self.vbucket.to_be_bytes());
        buf[8..12].copy_from_slice(&self.bodylen.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }

    pub fn value_len(&self) -> usize {
        self.bodylen as usize - self.keylen as usize - self.extlen as usize
    }
}

/// The extras section of a full packet.
pub fn packet_extras<'a>(header: &RequestHeader, packet: &'a [u8]) -> &'a [u8] {
    &packet[HEADER_LEN..HEADER_LEN + header.extlen as usize]
}

/// The key section of a full packet.
pub fn packet_key<'a>(header: &RequestHeader, packet: &'a [u8]) -> &'a [u8] {
    let start = HEADER_LEN + header.extlen as usize;
    &packet[start..start + header.keylen as usize]
}

/// The value section of a full packet.
pub fn packet_value<'a>(header: &RequestHeader, packet: &'a [u8]) -> &'a [u8] {
    let start = HEADER_LEN + header.extlen as usize + header.keylen as usize;
    &packet[start..header.total_len()]
}

/// A response header ready to serialise. The magic is implied: responses from
/// this core are always client-responses.
#[derive(Clone, Copy, Debug)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub datatype: u8,
    pub status: Status,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0; HEADER_LEN];
        buf[0] = Magic::ClientResponse as u8;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.keylen.to_be_bytes());
        buf[4] = self.extlen;
        buf[5] = self.datatype;
        buf[6..8].copy_from_slice(&(self.status as u16).to_be_bytes());
        buf[8..12].copy_from_slice(&self.bodylen.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_PACKET_SIZE;

    // a NOOP request with opaque 0x12345678
    const NOOP: [u8; 24] = [
        0x80, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56,
        0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn parse_noop() {
        let header = RequestHeader::parse(&NOOP).unwrap();
        assert_eq!(header.magic, Magic::ClientRequest);
        assert_eq!(header.opcode(), Some(ClientOpcode::Noop));
        assert_eq!(header.keylen, 0);
        assert_eq!(header.bodylen, 0);
        assert_eq!(header.opaque, 0x12345678);
        assert_eq!(header.cas, 0);
        assert!(header.validate(DEFAULT_MAX_PACKET_SIZE).is_ok());
    }

    #[test]
    fn parse_get() {
        // GET "x": keylen 1, bodylen 1, opaque 1
        let mut buf = [0u8; 25];
        buf[0] = 0x80;
        buf[1] = 0x00;
        buf[3] = 0x01;
        buf[11] = 0x01;
        buf[15] = 0x01;
        buf[24] = b'x';

        let header = RequestHeader::parse(&buf).unwrap();
        assert_eq!(header.opcode(), Some(ClientOpcode::Get));
        assert_eq!(header.total_len(), 25);
        assert_eq!(packet_key(&header, &buf), b"x");
        assert_eq!(packet_extras(&header, &buf), b"");
        assert_eq!(packet_value(&header, &buf), b"");
    }

    #[test]
    fn header_round_trip() {
        let header = RequestHeader::parse(&NOOP).unwrap();
        assert_eq!(header.to_bytes(), NOOP);
    }

    #[test]
    fn reject_bad_magic() {
        let mut buf = NOOP;
        buf[0] = 0x42;
        assert_eq!(
            RequestHeader::parse(&buf),
            Err(ProtocolError::UnknownMagic(0x42))
        );
    }

    #[test]
    fn reject_response_magic() {
        let mut buf = NOOP;
        buf[0] = 0x81;
        let header = RequestHeader::parse(&buf).unwrap();
        assert_eq!(
            header.validate(DEFAULT_MAX_PACKET_SIZE),
            Err(ProtocolError::NotARequest)
        );
    }

    #[test]
    fn reject_implausible_lengths() {
        // keylen larger than bodylen
        let mut buf = NOOP;
        buf[3] = 0x08;
        let header = RequestHeader::parse(&buf).unwrap();
        assert_eq!(
            header.validate(DEFAULT_MAX_PACKET_SIZE),
            Err(ProtocolError::ImplausibleLength)
        );

        // bodylen past the packet ceiling
        let mut buf = NOOP;
        buf[8] = 0xff;
        let header = RequestHeader::parse(&buf).unwrap();
        assert_eq!(
            header.validate(DEFAULT_MAX_PACKET_SIZE),
            Err(ProtocolError::ImplausibleLength)
        );
    }

    #[test]
    fn compose_response() {
        let header = ResponseHeader {
            opcode: ClientOpcode::Noop as u8,
            keylen: 0,
            extlen: 0,
            datatype: 0,
            status: Status::Success,
            bodylen: 0,
            opaque: 0x12345678,
            cas: 0,
        };
        let bytes = header.to_bytes();
        let expected: [u8; 24] = [
            0x81, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34,
            0x56, 0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn compose_error_response() {
        let header = ResponseHeader {
            opcode: ClientOpcode::Get as u8,
            keylen: 0,
            extlen: 0,
            datatype: 0,
            status: Status::KeyEnoent,
            bodylen: 0,
            opaque: 1,
            cas: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[6], 0x00);
        assert_eq!(bytes[7], 0x01);
    }
}
