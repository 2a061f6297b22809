//! Shared helpers for the scenario tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::conn::{Connector, Link, LinkEvent, LINK_CAPACITY};
use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use crate::relay::{EgressDispatcher, RelayOption};

pub const WAIT: Duration = Duration::from_secs(5);

/// Hands out in-memory links and exposes the far end of each
pub struct MemoryConnector {
    attempts: AtomicUsize,
    delay: Duration,
    fail: bool,
    remotes: mpsc::UnboundedSender<(String, Link)>,
}

impl MemoryConnector {
    pub fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Link)>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            attempts: AtomicUsize::new(0),
            delay,
            fail: false,
            remotes,
        };
        (Arc::new(connector), rx)
    }

    pub fn failing() -> Arc<Self> {
        let (remotes, _) = mpsc::unbounded_channel();
        Arc::new(MemoryConnector {
            attempts: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail: true,
            remotes,
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        if self.fail {
            return Err(Error::Transport("connection refused".to_string()));
        }
        let (local, remote) = Link::pair(LINK_CAPACITY);
        let _ = self.remotes.send((url.to_string(), remote));
        Ok(local)
    }
}

/// Connects each session to an in-process egress dispatcher
#[derive(Default)]
pub struct EgressConnector {
    attempts: AtomicUsize,
}

impl EgressConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for EgressConnector {
    async fn connect(&self, _url: &str) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = Link::pair(LINK_CAPACITY);
        EgressDispatcher::spawn(RelayOption::default(), remote);
        Ok(local)
    }
}

/// Far end of a [`ScriptedConnector`] link: raw outbound messages in,
/// transport events out
pub struct ScriptedRemote {
    pub sent: mpsc::Receiver<Vec<u8>>,
    pub events: mpsc::Sender<LinkEvent>,
}

impl ScriptedRemote {
    pub async fn next_frame(&mut self) -> Frame {
        let message = timeout(WAIT, self.sent.recv()).await.unwrap().unwrap();
        frame::decode(&message).unwrap()
    }

    pub async fn reply(&self, frame: Frame) {
        self.events
            .send(LinkEvent::Message(frame.encode()))
            .await
            .unwrap();
    }
}

/// Hands out links whose inbound events the test injects directly
pub struct ScriptedConnector {
    remotes: mpsc::UnboundedSender<ScriptedRemote>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedRemote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Arc::new(ScriptedConnector { remotes }), rx)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Link> {
        let (outbound, sent) = mpsc::channel(LINK_CAPACITY);
        let (events, inbound) = mpsc::channel(LINK_CAPACITY);
        let _ = self.remotes.send(ScriptedRemote { sent, events });
        Ok(Link { outbound, inbound })
    }
}

/// Next frame arriving on `link`
pub async fn next_frame(link: &mut Link) -> Frame {
    loop {
        match timeout(WAIT, link.inbound.recv()).await {
            Ok(Some(LinkEvent::Message(message))) => match frame::decode(&message) {
                Ok(frame) => return frame,
                Err(_) => continue,
            },
            other => panic!("expected a frame, got {:?}", other),
        }
    }
}

pub async fn send_frame(link: &Link, frame: Frame) {
    link.outbound.send(frame.encode()).await.unwrap();
}

/// Loopback TCP server echoing every byte; returns its port
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Loopback TCP server that writes `greeting` to each client and hangs up
pub async fn greeting_server(greeting: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(greeting).await;
            let _ = stream.shutdown().await;
        }
    });
    port
}

/// Loopback TCP server that accepts and holds each client without a word
pub async fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// SOCKS5 CONNECT request for 127.0.0.1:`port`
pub fn connect_request(port: u16) -> Vec<u8> {
    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Greeting plus request; returns the reply
pub async fn socks_connect<S>(stream: &mut S, request: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    stream.write_all(request).await.unwrap();
    let mut reply = vec![0u8; request.len()];
    timeout(WAIT, stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .unwrap();
    reply
}
