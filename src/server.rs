//! Server side: transport admission and the egress node

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use std::{cmp, io};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::auth::AuthGate;
use crate::config::{self, millis};
use crate::conn::{spawn_websocket, Link};
use crate::error::{Error, Result};
use crate::relay::{EgressDispatcher, RelayOption, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT};

/// Longest request head read before the upgrade is admitted
pub const MAX_REQUEST_HEAD: usize = 8192;

/// Server options for EgressServer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOption {
    /// Listen address
    pub host: String,

    /// Listen port for transport connections
    pub http_port: u16,

    pub username: String,

    pub password: String,

    /// Shared key material for the auth token
    pub key_file: Option<PathBuf>,

    /// Upper bound on each outbound dial, and on reading the request head
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Buffer size for data transfer
    pub buffer_size: usize,
}

impl Default for ServerOption {
    fn default() -> Self {
        ServerOption {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            username: String::new(),
            password: String::new(),
            key_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ServerOption {
    /// Load options from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        config::load_json(path)
    }

    /// Set the listen address
    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    /// Set the listen port
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_key_file(mut self, path: PathBuf) -> Self {
        self.key_file = Some(path);
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn relay_option(&self) -> RelayOption {
        RelayOption::default()
            .with_buffer_size(self.buffer_size)
            .with_connect_timeout(self.connect_timeout)
    }
}

/// EgressServer admits transport connections and runs a dispatcher on each
#[derive(Clone)]
pub struct EgressServer {
    options: Arc<ServerOption>,
    gate: AuthGate,
}

impl EgressServer {
    pub fn new(options: ServerOption) -> Result<Self> {
        let gate = AuthGate::from_key_file(
            &options.username,
            &options.password,
            options.key_file.as_deref(),
        )?;
        Ok(Self::with_gate(options, gate))
    }

    pub fn with_gate(options: ServerOption, gate: AuthGate) -> Self {
        EgressServer {
            options: Arc::new(options),
            gate,
        }
    }

    pub fn options(&self) -> &ServerOption {
        &self.options
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.options.host, self.options.http_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Egress server listening on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            trace!("Accepted connection from {}", peer);

            let server = self.clone();
            tokio::spawn(async move {
                match server.handle_connection(stream).await {
                    Ok(()) => debug!("[{}] transport connection finished", peer),
                    Err(Error::AuthFailed) => warn!("[{}] rejected: bad token", peer),
                    Err(e) => debug!("[{}] {}", peer, e),
                }
            });
        }
    }

    /// Admit one connection and serve its frames until it ends.
    ///
    /// A request that fails the token check is dropped without a single
    /// byte written back.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head = timeout(self.options.connect_timeout, read_request_line(&mut stream))
            .await
            .map_err(|_| Error::Timeout)??;

        let admitted = request_target(&head)
            .and_then(|target| request_query(&target))
            .map(|query| self.gate.verify_query(&query))
            .unwrap_or(false);
        if !admitted {
            drop(stream);
            return Err(Error::AuthFailed);
        }

        let ws = tokio_tungstenite::accept_async(Rewind::new(head, stream)).await?;
        info!("Transport connection admitted");

        let Link { outbound, inbound } = spawn_websocket(ws);
        EgressDispatcher::new(self.options.relay_option(), outbound)
            .run(inbound)
            .await;
        Ok(())
    }
}

/// Read until the end of the HTTP request line
async fn read_request_line<S>(stream: &mut S) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut head = BytesMut::with_capacity(1024);
    loop {
        if head.windows(2).any(|w| w == b"\r\n") {
            return Ok(head.freeze());
        }
        if head.len() >= MAX_REQUEST_HEAD {
            return Err(Error::Protocol("request line too long".to_string()));
        }
        if stream.read_buf(&mut head).await? == 0 {
            return Err(Error::Protocol("connection closed before request line".to_string()));
        }
    }
}

/// Request target of an HTTP request line
fn request_target(head: &[u8]) -> Option<String> {
    let end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..end]).ok()?;
    let mut parts = line.split(' ');
    let _method = parts.next()?;
    parts.next().map(str::to_string)
}

fn request_query(target: &str) -> Option<String> {
    let uri: http::Uri = target.parse().ok()?;
    uri.query().map(str::to_string)
}

/// Stream that replays already consumed bytes before reading further
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Rewind {
            prefix: Some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = cmp::min(prefix.len(), buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
