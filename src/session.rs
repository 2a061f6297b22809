//! Transport sessions and the connection broker
//!
//! A [`TransportSession`] is the single transport connection that carries
//! every tunnel of a client process. [`SessionBroker`] hands out the current
//! session, establishing a new one lazily when none is open. At most one
//! connection attempt is outstanding; every caller waiting on it observes
//! the same outcome.

use log::{debug, info, trace, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::auth::AuthGate;
use crate::conn::{Connector, Link, LinkEvent};
use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use crate::meter::ThroughputMeter;
use crate::tunnel::{Tunnel, TunnelEvent};

/// Events buffered per tunnel before the inbound loop waits on its owner
pub const TUNNEL_QUEUE: usize = 256;

type EventSender = mpsc::Sender<TunnelEvent>;

#[derive(Default)]
struct RegistryInner {
    tunnels: HashMap<u64, EventSender>,

    /// Set once the owning session tore down; no further registrations
    closed: bool,
}

/// Table of the tunnels multiplexed on one session
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl TunnelRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register under a fresh random id, regenerating on collision
    fn register(&self) -> Option<(u64, mpsc::Receiver<TunnelEvent>)> {
        loop {
            let id = rand::random::<u64>();
            match self.register_with_id(id) {
                Ok(events) => return events.map(|rx| (id, rx)),
                Err(()) => debug!("Tunnel id {:016x} already in use, regenerating", id),
            }
        }
    }

    /// `Err(())` if `id` is taken, `Ok(None)` if the registry is closed
    fn register_with_id(
        &self,
        id: u64,
    ) -> std::result::Result<Option<mpsc::Receiver<TunnelEvent>>, ()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(None);
        }
        match inner.tunnels.entry(id) {
            Entry::Occupied(_) => Err(()),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(TUNNEL_QUEUE);
                slot.insert(tx);
                Ok(Some(rx))
            }
        }
    }

    /// Hand an event to the tunnel registered under `id`, waiting while its
    /// queue is full
    async fn deliver(&self, id: u64, event: TunnelEvent) -> bool {
        let tx = match self.lock().tunnels.get(&id) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(event).await.is_ok()
    }

    pub fn remove(&self, id: u64) -> bool {
        self.lock().tunnels.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().tunnels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the registry and take every entry
    fn drain(&self) -> Vec<EventSender> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.tunnels.drain().map(|(_, tx)| tx).collect()
    }
}

/// TransportSession multiplexes tunnels over one link
pub struct TransportSession {
    url: String,
    outbound: mpsc::Sender<Vec<u8>>,
    tunnels: TunnelRegistry,
    open: AtomicBool,
    meter: ThroughputMeter,
}

impl TransportSession {
    /// Wrap an established link and start processing its inbound messages
    pub fn start(url: impl Into<String>, link: Link) -> Arc<Self> {
        let url = url.into();
        let Link { outbound, inbound } = link;
        let session = Arc::new(TransportSession {
            meter: ThroughputMeter::new(url.clone()),
            url,
            outbound,
            tunnels: TunnelRegistry::default(),
            open: AtomicBool::new(true),
        });

        tokio::spawn(session.clone().run(inbound));
        session
    }

    /// Inbound loop; frames are handled one at a time in arrival order
    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<LinkEvent>) {
        let last = loop {
            match inbound.recv().await {
                Some(LinkEvent::Message(message)) => self.dispatch(&message).await,
                Some(LinkEvent::Error(e)) => {
                    warn!("Transport session {} failed: {}", self.url, e);
                    break TunnelEvent::Error(e);
                }
                Some(LinkEvent::Closed { code, reason }) => {
                    break TunnelEvent::Closed { code, reason };
                }
                None => {
                    break TunnelEvent::Closed {
                        code: None,
                        reason: "transport dropped".to_string(),
                    }
                }
            }
        };
        self.teardown(last);
    }

    async fn dispatch(&self, message: &[u8]) {
        self.meter.record_down(message.len());

        let frame = match frame::decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping inbound frame: {}", e);
                return;
            }
        };

        let id = frame.tunnel_id;
        let opcode = frame.opcode;
        trace!("{} frame for tunnel {:016x} ({} bytes)", opcode, id, frame.payload.len());
        if !self.tunnels.deliver(id, TunnelEvent::from_frame(frame)).await {
            trace!("Dropping {} frame for unknown tunnel {:016x}", opcode, id);
        }
    }

    /// Notify every tunnel and clear the registry
    fn teardown(&self, event: TunnelEvent) {
        self.open.store(false, Ordering::SeqCst);
        let tunnels = self.tunnels.drain();
        info!(
            "Transport session {} closed ({} tunnels dropped)",
            self.url,
            tunnels.len()
        );
        // A full queue still ends in `None` once the sender is dropped
        for tx in tunnels {
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub fn meter(&self) -> &ThroughputMeter {
        &self.meter
    }

    /// New tunnel in the Opening state
    pub fn create_tunnel(self: &Arc<Self>) -> Result<Tunnel> {
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }
        let (id, events) = self.tunnels.register().ok_or(Error::SessionClosed)?;
        trace!("Tunnel {:016x} created on {}", id, self.url);
        Ok(Tunnel::new(id, self.clone(), events))
    }

    /// Send one frame as one transport message
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::SessionClosed);
        }
        let message = frame.encode();
        let len = message.len();
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::SessionClosed)?;
        self.meter.record_up(len);
        Ok(())
    }
}

type Outcome = std::result::Result<Arc<TransportSession>, String>;

enum BrokerState {
    Idle,
    Connecting(watch::Receiver<Option<Outcome>>),
    Ready(Arc<TransportSession>),
    Failed(String),
}

struct BrokerInner {
    base_url: String,
    gate: AuthGate,
    timeout: Duration,
    connector: Arc<dyn Connector>,
    state: Mutex<BrokerState>,
    attempts: AtomicUsize,
}

/// SessionBroker owns the client's single shared transport session
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

impl SessionBroker {
    pub fn new(
        base_url: impl Into<String>,
        gate: AuthGate,
        timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        SessionBroker {
            inner: Arc::new(BrokerInner {
                base_url: base_url.into(),
                gate,
                timeout,
                connector,
                state: Mutex::new(BrokerState::Idle),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// The open session, connecting first if there is none.
    ///
    /// Waits at most the configured timeout for an in-flight attempt. A
    /// timed-out wait does not cancel the attempt.
    pub async fn acquire(&self) -> Result<Arc<TransportSession>> {
        let mut pending = {
            let mut state = self.inner.lock_state();
            match &*state {
                BrokerState::Ready(session) if session.is_open() => return Ok(session.clone()),
                BrokerState::Connecting(rx) => rx.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *state = BrokerState::Connecting(rx.clone());
                    tokio::spawn(self.inner.clone().establish(tx));
                    rx
                }
            }
        };

        match timeout(self.inner.timeout, wait_outcome(&mut pending)).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(Error::Transport(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Number of connection attempts started so far
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Last connection failure, if the broker is in the failed state
    pub fn last_error(&self) -> Option<String> {
        match &*self.inner.lock_state() {
            BrokerState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }
}

impl BrokerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish(self: Arc<Self>, tx: watch::Sender<Option<Outcome>>) {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Connecting to {} (attempt {})", self.base_url, attempt);

        let outcome = match timeout(self.timeout, self.connect()).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out connecting to {}", self.base_url)),
        };

        {
            let mut state = self.lock_state();
            *state = match &outcome {
                Ok(session) => BrokerState::Ready(session.clone()),
                Err(e) => BrokerState::Failed(e.clone()),
            };
        }

        match &outcome {
            Ok(_) => info!("Transport session established to {}", self.base_url),
            Err(e) => warn!("Failed to connect to {}: {}", self.base_url, e),
        }
        let _ = tx.send(Some(outcome));
    }

    async fn connect(&self) -> Result<Arc<TransportSession>> {
        let url = self.gate.connection_url(&self.base_url)?;
        let link = self.connector.connect(&url).await?;
        Ok(TransportSession::start(self.base_url.clone(), link))
    }
}

async fn wait_outcome(rx: &mut watch::Receiver<Option<Outcome>>) -> Outcome {
    loop {
        let current = rx.borrow().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err("connection attempt abandoned".to_string());
        }
    }
}
