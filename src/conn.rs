//! Message transport plumbing for sockws
//!
//! A [`Link`] is one message-oriented connection seen as two channels. The
//! WebSocket pumps below own the socket; everything above them only deals
//! with whole binary messages.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    WebSocketStream,
};

use crate::error::{Error, Result};

/// Outbound queue depth per link
pub const LINK_CAPACITY: usize = 1024;

/// Something that happened on the receiving side of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One complete binary message
    Message(Vec<u8>),

    /// Transport failure; no further events follow
    Error(String),

    /// Orderly close; no further events follow
    Closed { code: Option<u16>, reason: String },
}

/// One message-oriented connection
pub struct Link {
    /// Each send is one atomic transport message
    pub outbound: mpsc::Sender<Vec<u8>>,

    pub inbound: mpsc::Receiver<LinkEvent>,
}

impl Link {
    /// Two in-memory links wired back to back.
    ///
    /// Dropping every outbound sender on one side closes the other side's
    /// inbound with [`LinkEvent::Closed`].
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let (a_in_tx, a_in_rx) = mpsc::channel(capacity);
        let (b_in_tx, b_in_rx) = mpsc::channel(capacity);

        tokio::spawn(forward_memory(a_rx, b_in_tx));
        tokio::spawn(forward_memory(b_rx, a_in_tx));

        (
            Link {
                outbound: a_tx,
                inbound: a_in_rx,
            },
            Link {
                outbound: b_tx,
                inbound: b_in_rx,
            },
        )
    }
}

async fn forward_memory(mut rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<LinkEvent>) {
    while let Some(msg) = rx.recv().await {
        if tx.send(LinkEvent::Message(msg)).await.is_err() {
            return;
        }
    }
    let _ = tx
        .send(LinkEvent::Closed {
            code: None,
            reason: "peer dropped".to_string(),
        })
        .await;
}

/// Opens links to a transport URL
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link>;
}

/// Connects over WebSocket (`ws://` or `wss://`)
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let request = url
            .into_client_request()
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;

        let (ws_stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!("WebSocket handshake completed ({})", response.status());

        Ok(spawn_websocket(ws_stream))
    }
}

/// Start reader and writer tasks for an established WebSocket
pub fn spawn_websocket<S>(stream: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(LINK_CAPACITY);
    let (inbound_tx, inbound) = mpsc::channel::<LinkEvent>(LINK_CAPACITY);

    // Reader task
    tokio::spawn(async move {
        let last = loop {
            match ws_receiver.next().await {
                Some(Ok(WsMessage::Binary(payload))) => {
                    if inbound_tx.send(LinkEvent::Message(payload)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    break LinkEvent::Closed { code, reason };
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    trace!("Received WebSocket Ping ({} bytes)", payload.len());
                }
                Some(Ok(other)) => {
                    trace!("Ignoring non-binary WebSocket message ({} bytes)", other.len());
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break LinkEvent::Error(e.to_string());
                }
                None => {
                    break LinkEvent::Closed {
                        code: None,
                        reason: "connection ended".to_string(),
                    }
                }
            }
        };
        let _ = inbound_tx.send(last).await;
    });

    // Writer task
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = ws_sender.send(WsMessage::Binary(msg)).await {
                error!("Failed to send message: {}", e);
                return;
            }
        }
        // Every sender dropped
        let _ = ws_sender.close().await;
    });

    Link { outbound, inbound }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_in_order() {
        let (a, mut b) = Link::pair(8);
        a.outbound.send(b"one".to_vec()).await.unwrap();
        a.outbound.send(b"two".to_vec()).await.unwrap();

        assert_eq!(b.inbound.recv().await, Some(LinkEvent::Message(b"one".to_vec())));
        assert_eq!(b.inbound.recv().await, Some(LinkEvent::Message(b"two".to_vec())));
    }

    #[tokio::test]
    async fn dropping_sender_closes_peer() {
        let (a, mut b) = Link::pair(8);
        drop(a);
        assert!(matches!(
            b.inbound.recv().await,
            Some(LinkEvent::Closed { .. })
        ));
    }
}
