//! Egress side: dials targets on behalf of tunnels and relays their bytes
//!
//! One [`EgressDispatcher`] serves one transport connection. Its
//! [`EgressRegistry`] holds at most one socket per tunnel id; an entry is
//! reserved when OPEN arrives and released exactly once, at which point a
//! single CLOSE frame is sent.

use log::{debug, info, trace, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::conn::{Link, LinkEvent};
use crate::frame::{self, Frame, OpenRequest, Opcode};
use crate::meter::ThroughputMeter;

/// Default buffer size for data transfer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay options
#[derive(Debug, Clone)]
pub struct RelayOption {
    /// Buffer size for data transfer
    pub buffer_size: usize,

    /// Upper bound on each outbound dial
    pub connect_timeout: Duration,
}

impl Default for RelayOption {
    fn default() -> Self {
        RelayOption {
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RelayOption {
    /// Set the buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Writes buffered per egress socket before the dispatcher waits on it
pub const SOCKET_QUEUE: usize = 256;

struct EgressEntry {
    serial: u64,

    /// Bytes queued for the socket's writer task
    data: mpsc::Sender<Vec<u8>>,

    /// Dropped on removal, which stops the reader task
    _stop: watch::Sender<()>,
}

#[derive(Default)]
struct RegistryInner {
    sockets: HashMap<u64, EgressEntry>,
    next_serial: u64,
}

/// Egress sockets by tunnel id
#[derive(Clone, Default)]
pub struct EgressRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// Handles held by the tasks of one reserved entry
struct Reservation {
    serial: u64,
    data: mpsc::Receiver<Vec<u8>>,
    stop: watch::Receiver<()>,
}

impl EgressRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id`; `None` if it is already taken
    fn reserve(&self, id: u64) -> Option<Reservation> {
        let mut inner = self.lock();
        let serial = inner.next_serial;
        match inner.sockets.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (data_tx, data) = mpsc::channel(SOCKET_QUEUE);
                let (stop_tx, stop) = watch::channel(());
                slot.insert(EgressEntry {
                    serial,
                    data: data_tx,
                    _stop: stop_tx,
                });
                inner.next_serial += 1;
                Some(Reservation { serial, data, stop })
            }
        }
    }

    /// Queue bytes for the socket under `id`, waiting while its queue is full
    async fn push(&self, id: u64, data: Vec<u8>) -> bool {
        let tx = match self.lock().sockets.get(&id) {
            Some(entry) => entry.data.clone(),
            None => return false,
        };
        tx.send(data).await.is_ok()
    }

    fn is_current(&self, id: u64, serial: u64) -> bool {
        matches!(self.lock().sockets.get(&id), Some(entry) if entry.serial == serial)
    }

    /// Release the entry if it still belongs to `serial`
    fn release(&self, id: u64, serial: u64) -> bool {
        let mut inner = self.lock();
        match inner.sockets.get(&id) {
            Some(entry) if entry.serial == serial => {
                inner.sockets.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Drop every entry without notifying the peer
    fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.sockets.len();
        inner.sockets.clear();
        n
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().sockets.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct DispatcherInner {
    options: RelayOption,
    outbound: mpsc::Sender<Vec<u8>>,
    sockets: EgressRegistry,
    meter: ThroughputMeter,
}

/// EgressDispatcher executes the frames of one transport connection
#[derive(Clone)]
pub struct EgressDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EgressDispatcher {
    /// Dispatcher replying on `outbound`
    pub fn new(options: RelayOption, outbound: mpsc::Sender<Vec<u8>>) -> Self {
        EgressDispatcher {
            inner: Arc::new(DispatcherInner {
                options,
                outbound,
                sockets: EgressRegistry::default(),
                meter: ThroughputMeter::new("egress"),
            }),
        }
    }

    /// Serve `link` in the background
    pub fn spawn(options: RelayOption, link: Link) -> Self {
        let Link { outbound, inbound } = link;
        let dispatcher = Self::new(options, outbound);
        tokio::spawn(dispatcher.clone().run(inbound));
        dispatcher
    }

    pub fn sockets(&self) -> &EgressRegistry {
        &self.inner.sockets
    }

    pub fn meter(&self) -> &ThroughputMeter {
        &self.inner.meter
    }

    /// Handle inbound messages in arrival order until the transport ends,
    /// then close every socket it owned
    pub async fn run(self, mut inbound: mpsc::Receiver<LinkEvent>) {
        loop {
            match inbound.recv().await {
                Some(LinkEvent::Message(message)) => self.handle_message(&message).await,
                Some(LinkEvent::Error(e)) => {
                    warn!("Transport connection failed: {}", e);
                    break;
                }
                Some(LinkEvent::Closed { code, reason }) => {
                    debug!("Transport connection closed ({:?} {})", code, reason);
                    break;
                }
                None => break,
            }
        }

        let dropped = self.inner.sockets.clear();
        info!("Transport connection ended, {} egress sockets closed", dropped);
    }

    /// Execute one frame
    pub async fn handle_message(&self, message: &[u8]) {
        self.inner.meter.record_down(message.len());

        let frame = match frame::decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping inbound frame: {}", e);
                return;
            }
        };

        let id = frame.tunnel_id;
        match frame.opcode {
            Opcode::Open => self.open(id, &frame.payload).await,
            Opcode::Data => {
                if !self.inner.sockets.push(id, frame.payload).await {
                    debug!("DATA for unknown tunnel {:016x}", id);
                    self.send(Frame::empty(id, Opcode::Close)).await;
                }
            }
            Opcode::Close => trace!("Ignoring CLOSE for tunnel {:016x}", id),
            Opcode::Ping => trace!("PING on tunnel {:016x}", id),
        }
    }

    async fn open(&self, id: u64, payload: &[u8]) {
        let request = match OpenRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Bad OPEN for tunnel {:016x}: {}", id, e);
                self.send(Frame::empty(id, Opcode::Close)).await;
                return;
            }
        };

        let reservation = match self.inner.sockets.reserve(id) {
            Some(reservation) => reservation,
            None => {
                warn!("OPEN for tunnel {:016x} which is already in use", id);
                self.send(Frame::empty(id, Opcode::Close)).await;
                return;
            }
        };

        tokio::spawn(self.clone().connect(id, request, reservation));
    }

    async fn connect(self, id: u64, request: OpenRequest, reservation: Reservation) {
        let Reservation { serial, data, stop } = reservation;
        let target = request.address();
        debug!("Tunnel {:016x} connecting to {}", id, target);

        let dialed = timeout(
            self.inner.options.connect_timeout,
            TcpStream::connect((request.host.as_str(), request.port)),
        )
        .await;
        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Tunnel {:016x} failed to connect to {}: {}", id, target, e);
                self.release(id, serial).await;
                return;
            }
            Err(_) => {
                debug!("Tunnel {:016x} timed out connecting to {}", id, target);
                self.release(id, serial).await;
                return;
            }
        };

        // The transport may have ended while dialing
        if !self.inner.sockets.is_current(id, serial) {
            return;
        }

        self.send(Frame::empty(id, Opcode::Open)).await;

        let (reader, writer) = stream.into_split();
        tokio::spawn(self.clone().write_loop(id, serial, writer, data));
        self.read_loop(id, serial, reader, stop).await;
    }

    async fn read_loop(
        self,
        id: u64,
        serial: u64,
        mut reader: OwnedReadHalf,
        mut stop: watch::Receiver<()>,
    ) {
        let mut buffer = vec![0u8; self.inner.options.buffer_size.max(1)];

        loop {
            tokio::select! {
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let frame = Frame::new(id, Opcode::Data, buffer[..n].to_vec());
                        if !self.send(frame).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Tunnel {:016x} read failed: {}", id, e);
                        break;
                    }
                },
                _ = stop.changed() => return,
            }
        }

        self.release(id, serial).await;
    }

    async fn write_loop(
        self,
        id: u64,
        serial: u64,
        mut writer: OwnedWriteHalf,
        mut data: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(bytes) = data.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("Tunnel {:016x} write failed: {}", id, e);
                self.release(id, serial).await;
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Deregister and send the one CLOSE for this socket
    async fn release(&self, id: u64, serial: u64) {
        if self.inner.sockets.release(id, serial) {
            trace!("Tunnel {:016x} released", id);
            self.send(Frame::empty(id, Opcode::Close)).await;
        }
    }

    async fn send(&self, frame: Frame) -> bool {
        let message = frame.encode();
        let len = message.len();
        if self.inner.outbound.send(message).await.is_err() {
            return false;
        }
        self.inner.meter.record_up(len);
        true
    }
}
