//! Frame codec for the tunnel multiplexing protocol
//!
//! Every transport message is one frame: a fixed 16 byte header followed by
//! the payload.
//!
//! ```text
//! +-----------+----------------+--------+-----------+
//! | magic (7) | tunnel id (8)  | op (1) | payload   |
//! +-----------+----------------+--------+-----------+
//! ```
//!
//! The tunnel id is an unsigned 64-bit big-endian integer.

use crate::error::{Error, Result};
use std::fmt;

/// Magic tag opening every frame
pub const MAGIC: &[u8; 7] = b"sock.ws";

/// Header length in bytes
pub const HEADER_LEN: usize = 16;

/// Frame operation.
///
/// Discriminants are the ASCII tags used on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Open = b'O',
    Data = b'D',
    Close = b'C',
    Ping = b'P',
}

impl Opcode {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            b'O' => Ok(Opcode::Open),
            b'D' => Ok(Opcode::Data),
            b'C' => Ok(Opcode::Close),
            b'P' => Ok(Opcode::Ping),
            _ => Err(Error::Protocol(format!("unknown opcode: {:#04x}", b))),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Open => "OPEN",
            Opcode::Data => "DATA",
            Opcode::Close => "CLOSE",
            Opcode::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tunnel_id: u64,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tunnel_id: u64, opcode: Opcode, payload: Vec<u8>) -> Self {
        Frame {
            tunnel_id,
            opcode,
            payload,
        }
    }

    /// Frame without payload (OPEN acknowledgment, CLOSE, PING)
    pub fn empty(tunnel_id: u64, opcode: Opcode) -> Self {
        Self::new(tunnel_id, opcode, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.tunnel_id, self.opcode, &self.payload)
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        decode(message)
    }
}

/// Encode a frame into a single transport message
pub fn encode(tunnel_id: u64, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&tunnel_id.to_be_bytes());
    buf.push(opcode as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a transport message.
///
/// Short messages, a wrong magic tag or an unknown opcode yield
/// [`Error::Protocol`]; callers drop such frames.
pub fn decode(message: &[u8]) -> Result<Frame> {
    if message.len() < HEADER_LEN {
        return Err(Error::Protocol(format!(
            "frame too short: {} bytes",
            message.len()
        )));
    }

    if &message[..7] != MAGIC {
        return Err(Error::Protocol("magic mismatch".to_string()));
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&message[7..15]);
    let opcode = Opcode::from_u8(message[15])?;

    Ok(Frame {
        tunnel_id: u64::from_be_bytes(id),
        opcode,
        payload: message[HEADER_LEN..].to_vec(),
    })
}

/// Target carried by an OPEN frame: `host_len(1) ++ host ++ port(2, BE)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub host: String,
    pub port: u16,
}

impl OpenRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        OpenRequest {
            host: host.into(),
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let host = self.host.as_bytes();
        if host.len() > u8::MAX as usize {
            return Err(Error::HostTooLong(host.len()));
        }

        let mut buf = Vec::with_capacity(3 + host.len());
        buf.push(host.len() as u8);
        buf.extend_from_slice(host);
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let host_len = *payload
            .first()
            .ok_or_else(|| Error::Protocol("empty OPEN payload".to_string()))?
            as usize;
        if payload.len() < 1 + host_len + 2 {
            return Err(Error::Protocol(format!(
                "OPEN payload truncated: {} bytes for host length {}",
                payload.len(),
                host_len
            )));
        }

        let host = String::from_utf8(payload[1..1 + host_len].to_vec())
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in host: {}", e)))?;
        let port = u16::from_be_bytes([payload[1 + host_len], payload[2 + host_len]]);

        Ok(OpenRequest { host, port })
    }

    /// `host:port` as accepted by `TcpStream::connect`
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let buf = encode(0x0102030405060708, Opcode::Data, b"xyz");
        assert_eq!(&buf[..7], b"sock.ws");
        assert_eq!(&buf[7..15], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[15], b'D');
        assert_eq!(&buf[16..], b"xyz");
    }

    #[test]
    fn decode_restores_frame() {
        let frame = Frame::new(u64::MAX, Opcode::Open, vec![0, 1, 2, 255]);
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);

        let empty = Frame::empty(7, Opcode::Close);
        let buf = empty.encode();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(decode(&buf).unwrap(), empty);
    }

    #[test]
    fn short_message_is_rejected() {
        let buf = encode(1, Opcode::Ping, b"");
        assert!(matches!(decode(&buf[..15]), Err(Error::Protocol(_))));
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let mut buf = encode(1, Opcode::Data, b"payload");
        buf[0] = b'S';
        assert!(matches!(decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = encode(1, Opcode::Data, b"");
        buf[15] = b'R';
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn open_request_layout() {
        let req = OpenRequest::new("example.com", 443);
        let buf = req.encode().unwrap();
        assert_eq!(buf[0], 11);
        assert_eq!(&buf[1..12], b"example.com");
        assert_eq!(&buf[12..], &[0x01, 0xbb]);
        assert_eq!(OpenRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn open_request_bounds() {
        let long = "a".repeat(256);
        assert!(matches!(
            OpenRequest::new(long, 80).encode(),
            Err(Error::HostTooLong(256))
        ));
        assert!(OpenRequest::decode(&[5, b'a', b'b']).is_err());
        assert!(OpenRequest::decode(&[]).is_err());
    }

    #[test]
    fn ipv6_address_is_bracketed() {
        assert_eq!(OpenRequest::new("::1", 22).address(), "[::1]:22");
        assert_eq!(OpenRequest::new("10.0.1.10", 80).address(), "10.0.1.10:80");
    }
}
