//! Client side: the local SOCKS5 gateway

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::auth::AuthGate;
use crate::config::{self, millis};
use crate::conn::{Connector, WebSocketConnector};
use crate::error::{Error, Result};
use crate::session::SessionBroker;
use crate::socks5::{
    self, Reply, Request, REP_NETWORK_UNREACHABLE, REP_SUCCEEDED, REP_TUNNEL_CLOSED,
};
use crate::tunnel::{Tunnel, TunnelEvent};

/// Default buffer size for data transfer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default timeout for connecting and opening tunnels
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How accepted requests reach their target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Dial the target from this process
    Direct,

    /// Carry the stream through a tunnel to the egress node
    #[default]
    Tunnel,
}

/// Client options for Socks5Gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOption {
    /// SOCKS5 listen address
    pub client_host: String,

    /// SOCKS5 listen port
    pub client_port: u16,

    /// Egress node URL
    pub server_url: String,

    pub username: String,

    pub password: String,

    /// Session acquisition, connection and tunnel open timeout
    #[serde(with = "millis")]
    pub timeout: Duration,

    pub mode: DispatchMode,

    /// Shared key material for the auth token
    pub key_file: Option<PathBuf>,

    /// Buffer size for data transfer
    pub buffer_size: usize,
}

impl Default for ClientOption {
    fn default() -> Self {
        ClientOption {
            client_host: "127.0.0.1".to_string(),
            client_port: 1080,
            server_url: "ws://127.0.0.1:8080/".to_string(),
            username: String::new(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT,
            mode: DispatchMode::Tunnel,
            key_file: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ClientOption {
    /// Load options from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        config::load_json(path)
    }

    /// Set the SOCKS5 listen address
    pub fn with_client_host(mut self, host: String) -> Self {
        self.client_host = host;
        self
    }

    /// Set the SOCKS5 listen port
    pub fn with_client_port(mut self, port: u16) -> Self {
        self.client_port = port;
        self
    }

    /// Set the egress node URL
    pub fn with_server_url(mut self, url: String) -> Self {
        self.server_url = url;
        self
    }

    /// Set the credentials mixed into the auth token
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_key_file(mut self, path: PathBuf) -> Self {
        self.key_file = Some(path);
        self
    }

    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Socks5Gateway accepts local SOCKS5 connections and binds each request
/// to a direct dial or a tunnel
#[derive(Clone)]
pub struct Socks5Gateway {
    options: Arc<ClientOption>,
    broker: SessionBroker,
}

impl Socks5Gateway {
    /// Create a gateway that reaches the egress node over WebSocket
    pub fn new(options: ClientOption) -> Result<Self> {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(options: ClientOption, connector: Arc<dyn Connector>) -> Result<Self> {
        let gate = AuthGate::from_key_file(
            &options.username,
            &options.password,
            options.key_file.as_deref(),
        )?;
        let broker = SessionBroker::new(
            options.server_url.clone(),
            gate,
            options.timeout,
            connector,
        );
        Ok(Socks5Gateway {
            options: Arc::new(options),
            broker,
        })
    }

    pub fn options(&self) -> &ClientOption {
        &self.options
    }

    pub fn broker(&self) -> &SessionBroker {
        &self.broker
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.options.client_host, self.options.client_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "SOCKS5 gateway listening on {} ({:?} mode)",
            listener.local_addr()?,
            self.options.mode
        );
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            trace!("Accepted SOCKS5 connection from {}", peer);

            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream).await {
                    debug!("[{}] {}", peer, e);
                }
            });
        }
    }

    /// Run one SOCKS5 session to completion.
    ///
    /// Every parsed request receives exactly one reply; failures past that
    /// point are returned but never written to the client.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        socks5::negotiate(&mut stream).await?;
        let request = socks5::read_request(&mut stream).await?;
        debug!("Request for {}", request.target());

        match self.options.mode {
            DispatchMode::Direct => self.dispatch_direct(stream, request).await,
            DispatchMode::Tunnel => self.dispatch_tunnel(stream, request).await,
        }
    }

    async fn dispatch_direct<S>(&self, mut stream: S, request: Request) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reply = Reply::new(request.raw.clone());
        let target = request.target();

        let dialed = timeout(
            self.options.timeout,
            TcpStream::connect((request.host.as_str(), request.port)),
        )
        .await;
        let mut remote = match dialed {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                reply.send(&mut stream, socks5::dial_status(&e)).await?;
                return Err(Error::Dial { target, source: e });
            }
            Err(_) => {
                reply.send(&mut stream, REP_NETWORK_UNREACHABLE).await?;
                return Err(Error::Timeout);
            }
        };
        reply.send(&mut stream, REP_SUCCEEDED).await?;

        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
        debug!("{} finished, {} bytes up, {} bytes down", target, up, down);
        Ok(())
    }

    async fn dispatch_tunnel<S>(&self, mut stream: S, request: Request) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reply = Reply::new(request.raw.clone());

        let session = match self.broker.acquire().await {
            Ok(session) => session,
            Err(e) => {
                warn!("No transport session for {}: {}", request.target(), e);
                reply.send(&mut stream, REP_NETWORK_UNREACHABLE).await?;
                return Err(e);
            }
        };

        let mut tunnel = match session.create_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => {
                reply.send(&mut stream, REP_NETWORK_UNREACHABLE).await?;
                return Err(e);
            }
        };

        let opened = tunnel
            .open(&request.host, request.port, self.options.timeout)
            .await;
        match opened {
            Ok(true) => {}
            Ok(false) => {
                reply.send(&mut stream, REP_NETWORK_UNREACHABLE).await?;
                return Err(Error::TunnelOpenFailed(tunnel.id()));
            }
            Err(e) => {
                reply.send(&mut stream, REP_NETWORK_UNREACHABLE).await?;
                return Err(e);
            }
        }

        debug!("Tunnel {:016x} open to {}", tunnel.id(), request.target());
        reply.send(&mut stream, REP_SUCCEEDED).await?;
        self.pipe(stream, tunnel, reply).await
    }

    /// Copy between the local socket and an open tunnel until either side ends.
    ///
    /// Returning drops `tunnel`, which removes it from the session.
    async fn pipe<S>(&self, stream: S, mut tunnel: Tunnel, mut reply: Reply) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = tunnel.id();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; self.options.buffer_size.max(1)];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        trace!("Tunnel {:016x} local side closed", id);
                        break;
                    }
                    Ok(n) => tunnel.write(&buf[..n]).await?,
                    Err(e) => {
                        debug!("Tunnel {:016x} local read failed: {}", id, e);
                        break;
                    }
                },
                event = tunnel.next_event() => match event {
                    Some(TunnelEvent::Data(data)) => writer.write_all(&data).await?,
                    Some(TunnelEvent::Opened) | Some(TunnelEvent::Ping) => {}
                    Some(TunnelEvent::Closed { code, reason }) => {
                        debug!("Tunnel {:016x} closed ({:?} {})", id, code, reason);
                        reply.send(&mut writer, REP_TUNNEL_CLOSED).await?;
                        break;
                    }
                    Some(TunnelEvent::Error(e)) => {
                        debug!("Tunnel {:016x} failed: {}", id, e);
                        reply.send(&mut writer, REP_NETWORK_UNREACHABLE).await?;
                        break;
                    }
                    None => break,
                },
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}
