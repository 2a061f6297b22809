//! Tunnel: one logical stream multiplexed over a transport session

use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::frame::{Frame, OpenRequest, Opcode};
use crate::session::TransportSession;

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// OPEN sent, waiting for the acknowledgment
    Opening,

    Open,

    /// Terminal
    Closed,
}

/// Notifications delivered to a tunnel's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The egress node acknowledged OPEN
    Opened,

    /// Application bytes from the egress node
    Data(Vec<u8>),

    Ping,

    /// Remote CLOSE, or the transport closed
    Closed { code: Option<u16>, reason: String },

    /// The transport failed
    Error(String),
}

impl TunnelEvent {
    /// Event carried by an inbound frame
    pub fn from_frame(frame: Frame) -> Self {
        match frame.opcode {
            Opcode::Open => TunnelEvent::Opened,
            Opcode::Data => TunnelEvent::Data(frame.payload),
            Opcode::Ping => TunnelEvent::Ping,
            Opcode::Close => TunnelEvent::Closed {
                code: None,
                reason: "closed by egress".to_string(),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelEvent::Closed { .. } | TunnelEvent::Error(_))
    }
}

/// A multiplexed logical stream.
///
/// Dropping a tunnel removes it from its session's registry; frames that
/// arrive for it afterwards are dropped as stale.
pub struct Tunnel {
    id: u64,
    state: TunnelState,
    registered: bool,
    session: Arc<TransportSession>,
    events: mpsc::Receiver<TunnelEvent>,
}

impl Tunnel {
    pub(crate) fn new(
        id: u64,
        session: Arc<TransportSession>,
        events: mpsc::Receiver<TunnelEvent>,
    ) -> Self {
        Tunnel {
            id,
            state: TunnelState::Opening,
            registered: true,
            session,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Ask the egress node to dial `host:port`.
    ///
    /// Resolves to `true` iff the first frame answering this tunnel is an
    /// OPEN and it arrives within `wait`. Any other outcome destroys the
    /// tunnel and resolves to `false`.
    ///
    /// An OPEN answered after the timeout is dropped as stale, but the egress
    /// socket it acknowledges stays open until its target hangs up, since no
    /// CLOSE is sent for it.
    pub async fn open(&mut self, host: &str, port: u16, wait: Duration) -> Result<bool> {
        if self.state != TunnelState::Opening {
            return Err(Error::Protocol(format!(
                "tunnel {:016x} already left the opening state",
                self.id
            )));
        }

        let payload = OpenRequest::new(host, port).encode()?;
        if let Err(e) = self
            .session
            .send(Frame::new(self.id, Opcode::Open, payload))
            .await
        {
            self.destroy();
            return Err(e);
        }

        let opened = match timeout(wait, self.events.recv()).await {
            Ok(Some(TunnelEvent::Opened)) => true,
            Ok(Some(other)) => {
                debug!("Tunnel {:016x} open answered with {:?}", self.id, other);
                false
            }
            Ok(None) => false,
            Err(_) => {
                debug!("Tunnel {:016x} open timed out after {:?}", self.id, wait);
                false
            }
        };

        if opened {
            self.state = TunnelState::Open;
        } else {
            self.destroy();
        }
        Ok(opened)
    }

    /// Send application bytes as one DATA frame
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.state != TunnelState::Open {
            return Err(Error::TunnelNotOpen(self.id));
        }
        self.session
            .send(Frame::new(self.id, Opcode::Data, data.to_vec()))
            .await
    }

    /// Next notification; `None` once the tunnel is destroyed and drained
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(e) if e.is_terminal() => self.destroy(),
            None => self.destroy(),
            _ => {}
        }
        event
    }

    /// Remove this tunnel from its session's registry
    pub fn destroy(&mut self) {
        self.state = TunnelState::Closed;
        if self.registered {
            self.registered = false;
            self.session.tunnels().remove(self.id);
            trace!("Tunnel {:016x} destroyed", self.id);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.destroy();
    }
}
