//! SOCKS5 wire handling for the local gateway
//!
//! Only the NOAUTH method is ever offered. Requests are parsed for CONNECT
//! semantics; the command byte is carried along but not interpreted.
//!
//! ```text
//! request: | VER | CMD | RSV | ATYP | DST.ADDR (var) | DST.PORT (2) |
//! reply:   | VER | REP | RSV | ATYP | BND.ADDR (var) | BND.PORT (2) |
//! ```
//!
//! The reply echoes the request bytes with only `REP` replaced.

use log::debug;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;
/// Unassigned code signalled when an established tunnel is closed
pub const REP_TUNNEL_CLOSED: u8 = 0x09;
/// Unassigned code for unclassified dial failures
pub const REP_DIAL_FAILED: u8 = 0xFF;

/// Method negotiation.
///
/// A version other than 5 is answered with `[5, 0xFF]` and an error;
/// otherwise NOAUTH is selected regardless of the offered methods.
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await?;
    if hdr[0] != SOCKS5_VERSION {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::UnsupportedVersion(hdr[0]));
    }

    let mut methods = vec![0u8; hdr[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// A parsed request together with its raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub raw: Vec<u8>,
    pub command: u8,
    pub host: String,
    pub port: u16,
}

impl Request {
    /// `host:port`, bracketing IPv6 literals
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Read one request.
///
/// An unknown address type is answered with status 0x08 and reported as
/// [`Error::AddressTypeUnsupported`].
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = vec![0u8; 4];
    stream.read_exact(&mut raw).await?;
    let command = raw[1];
    let atyp = raw[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut a = [0u8; 4];
            stream.read_exact(&mut a).await?;
            raw.extend_from_slice(&a);
            Ipv4Addr::from(a).to_string()
        }
        ATYP_DOMAIN => {
            let mut l = [0u8; 1];
            stream.read_exact(&mut l).await?;
            let mut name = vec![0u8; l[0] as usize];
            stream.read_exact(&mut name).await?;
            raw.push(l[0]);
            raw.extend_from_slice(&name);
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut a = [0u8; 16];
            stream.read_exact(&mut a).await?;
            raw.extend_from_slice(&a);
            Ipv6Addr::from(a).to_string()
        }
        _ => {
            Reply::new(raw)
                .send(stream, REP_ATYP_NOT_SUPPORTED)
                .await?;
            return Err(Error::AddressTypeUnsupported(atyp));
        }
    };

    let mut p = [0u8; 2];
    stream.read_exact(&mut p).await?;
    raw.extend_from_slice(&p);

    Ok(Request {
        raw,
        command,
        host,
        port: u16::from_be_bytes(p),
    })
}

/// The single reply a request receives; later sends are no-ops
#[derive(Debug)]
pub struct Reply {
    request: Vec<u8>,
    sent: Option<u8>,
}

impl Reply {
    pub fn new(request: Vec<u8>) -> Self {
        Reply {
            request,
            sent: None,
        }
    }

    /// Request bytes with the status byte replaced
    pub fn encode(&self, status: u8) -> Vec<u8> {
        let mut buf = self.request.clone();
        if buf.len() > 1 {
            buf[1] = status;
        }
        buf
    }

    /// Status already sent, if any
    pub fn status(&self) -> Option<u8> {
        self.sent
    }

    /// Write the reply; returns `false` when one was already sent
    pub async fn send<W>(&mut self, stream: &mut W, status: u8) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(first) = self.sent {
            debug!(
                "Reply {:#04x} suppressed, {:#04x} already sent",
                status, first
            );
            return Ok(false);
        }
        self.sent = Some(status);
        stream.write_all(&self.encode(status)).await?;
        Ok(true)
    }
}

/// Reply status for a failed direct dial
pub fn dial_status(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::HostUnreachable => REP_HOST_UNREACHABLE,
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::TimedOut => REP_NETWORK_UNREACHABLE,
        _ => REP_DIAL_FAILED,
    }
}
