// parley-rs - The Parley SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UDP transport for the stack.
//!
//! Owns the process's UDP sockets through a reference-counted pool so any
//! number of parties can share one bound socket. Each socket runs a receive
//! loop that forwards raw datagrams (as [`InboundPacket`]) to the single
//! consumer handed out by [`UdpTransport::new`]; parsing and routing happen
//! above this layer.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use sip_transport::{ListenSpec, UdpTransport};
//! # async fn example() -> anyhow::Result<()> {
//! let (transport, mut inbound) = UdpTransport::new(Duration::from_secs(5));
//! let binding = transport.listen(&ListenSpec::loopback()).await?;
//! while let Some(packet) = inbound.recv().await {
//!     println!("{} bytes from {}", packet.payload.len(), packet.peer);
//! }
//! # drop(binding); Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sip_observe::{stack_metrics, StackMetrics, TracingStackMetrics};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How many times a bind is retried before giving up.
const MAX_BIND_ATTEMPTS: usize = 20;

/// Wait applied before the single retry of an EAGAIN send failure.
const EAGAIN_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

const ENETUNREACH: i32 = 101;
const EHOSTUNREACH: i32 = 113;

/// Transport layer failures.
#[derive(Debug)]
pub enum TransportError {
    /// Binding failed on every allowed attempt.
    BindFailed { attempts: usize, last: io::Error },
    /// The destination is unreachable; terminal for the owning transaction.
    Unreachable(io::Error),
    /// An I/O error that is not known to be terminal.
    SendFailed(io::Error),
    /// The socket was released and its linger elapsed.
    SocketClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::BindFailed { attempts, last } => {
                write!(f, "bind failed after {attempts} attempts: {last}")
            }
            TransportError::Unreachable(e) => write!(f, "destination unreachable: {e}"),
            TransportError::SendFailed(e) => write!(f, "send failed: {e}"),
            TransportError::SocketClosed => write!(f, "socket closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// True when the owning transaction should terminate rather than retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::SocketClosed)
    }
}

/// A raw datagram handed up from a receive loop.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Sender address.
    pub peer: SocketAddr,
    /// Local socket the datagram arrived on; replies should leave from it.
    pub local: SocketAddr,
    pub payload: Bytes,
}

/// What a caller wants from `listen`.
#[derive(Clone, Default)]
pub struct ListenSpec {
    /// Local address; `None` binds the wildcard address.
    pub addr: Option<IpAddr>,
    /// Port; 0 lets the OS pick (subject to `port_filter`).
    pub port: u16,
    /// Predicate over the chosen port, e.g. "even ports only" for RTP-style
    /// pairing. Checked both when reusing and after a fresh bind.
    pub port_filter: Option<Arc<dyn Fn(u16) -> bool + Send + Sync>>,
    /// When set the socket is not shared with any other caller.
    pub exclusive: bool,
}

impl fmt::Debug for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSpec")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("port_filter", &self.port_filter.is_some())
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

impl ListenSpec {
    /// Loopback on an ephemeral port, the shape every test wants.
    pub fn loopback() -> Self {
        Self {
            addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn accepts(&self, local: SocketAddr) -> bool {
        if let Some(addr) = self.addr {
            if addr != local.ip() {
                return false;
            }
        }
        if self.port != 0 && self.port != local.port() {
            return false;
        }
        match &self.port_filter {
            Some(filter) => filter(local.port()),
            None => true,
        }
    }
}

struct PoolEntry {
    socket: Arc<UdpSocket>,
    refs: usize,
    exclusive: bool,
    linger_until: Option<Instant>,
    recv_task: tokio::task::JoinHandle<()>,
}

/// Reference-counted handle to a pooled socket. Dropping it releases the
/// reference; the underlying socket closes only once every reference is gone
/// and the linger period has elapsed.
pub struct SocketBinding {
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
    transport: Weak<UdpTransport>,
    released: std::sync::atomic::AtomicBool,
}

impl fmt::Debug for SocketBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketBinding")
            .field("local", &self.local)
            .finish()
    }
}

impl SocketBinding {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Sends a datagram from this socket.
    pub async fn send_to(&self, dest: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        send_datagram(&self.socket, dest, payload).await
    }

    /// Releases this reference explicitly. Also happens on drop.
    pub fn release(&self) {
        if self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.release(self.local);
        }
    }
}

impl Drop for SocketBinding {
    fn drop(&mut self) {
        self.release();
    }
}

/// Process-scoped UDP transport: the socket pool plus the inbound funnel.
pub struct UdpTransport {
    pool: Mutex<HashMap<SocketAddr, PoolEntry>>,
    send_locks: Mutex<HashMap<SocketAddr, Arc<tokio::sync::Mutex<()>>>>,
    inbound_tx: mpsc::Sender<InboundPacket>,
    linger: Duration,
    metrics: Arc<dyn StackMetrics>,
    self_ref: Mutex<Weak<UdpTransport>>,
}

impl UdpTransport {
    /// Creates a transport and hands back the single inbound consumer.
    pub fn new(linger: Duration) -> (Arc<Self>, mpsc::Receiver<InboundPacket>) {
        Self::with_metrics(linger, Arc::new(TracingStackMetrics))
    }

    /// Creates a transport reporting to the supplied metrics sink.
    pub fn with_metrics(
        linger: Duration,
        metrics: Arc<dyn StackMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundPacket>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let transport = Arc::new(Self {
            pool: Mutex::new(HashMap::new()),
            send_locks: Mutex::new(HashMap::new()),
            inbound_tx,
            linger,
            metrics,
            self_ref: Mutex::new(Weak::new()),
        });
        *transport.self_ref.lock() = Arc::downgrade(&transport);
        (transport, inbound_rx)
    }

    /// Returns an existing pooled socket satisfying `spec`, or binds a new
    /// one. Bind retries up to 20 times, re-rolling ephemeral ports that the
    /// port filter rejects.
    pub async fn listen(&self, spec: &ListenSpec) -> Result<SocketBinding, TransportError> {
        if !spec.exclusive {
            let mut pool = self.pool.lock();
            for (local, entry) in pool.iter_mut() {
                if !entry.exclusive && spec.accepts(*local) {
                    entry.refs += 1;
                    entry.linger_until = None;
                    debug!(%local, refs = entry.refs, "reusing pooled socket");
                    return Ok(self.binding_for(*local, entry.socket.clone()));
                }
            }
        }

        let addr = spec.addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no bind attempted");
        for attempt in 1..=MAX_BIND_ATTEMPTS {
            match bind_socket(SocketAddr::new(addr, spec.port)) {
                Ok(socket) => {
                    let local = match socket.local_addr() {
                        Ok(local) => local,
                        Err(e) => {
                            last_err = e;
                            continue;
                        }
                    };
                    if let Some(filter) = &spec.port_filter {
                        if !filter(local.port()) {
                            // Ephemeral port did not suit; roll again.
                            if spec.port != 0 {
                                return Err(TransportError::BindFailed {
                                    attempts: attempt,
                                    last: io::Error::new(
                                        io::ErrorKind::AddrInUse,
                                        "requested port rejected by filter",
                                    ),
                                });
                            }
                            continue;
                        }
                    }
                    let socket = Arc::new(socket);
                    self.install(local, socket.clone(), spec.exclusive);
                    info!(%local, "listening (udp)");
                    return Ok(self.binding_for(local, socket));
                }
                Err(e) => {
                    debug!(attempt, %e, "bind attempt failed");
                    last_err = e;
                }
            }
        }
        Err(TransportError::BindFailed {
            attempts: MAX_BIND_ATTEMPTS,
            last: last_err,
        })
    }

    /// Sends from the pooled socket bound to `local`.
    pub async fn send_from(
        &self,
        local: SocketAddr,
        dest: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let (socket, lock) = {
            let pool = self.pool.lock();
            match pool.get(&local) {
                Some(entry) => (entry.socket.clone(), self.send_lock_for(local)),
                None => return Err(TransportError::SocketClosed),
            }
        };
        let _guard = lock.lock().await;
        let result = send_datagram(&socket, dest, payload).await;
        if result.is_ok() {
            self.metrics.on_packet_sent();
        }
        result
    }

    /// Resolves a host/port pair to a socket address (first A/AAAA result).
    pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let target = format!("{host}:{port}");
        let mut addrs = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(TransportError::SendFailed)?;
        addrs.next().ok_or(TransportError::SendFailed(io::Error::new(
            io::ErrorKind::NotFound,
            "name resolved to no addresses",
        )))
    }

    /// Number of live sockets, lingering ones included.
    pub fn socket_count(&self) -> usize {
        self.pool.lock().len()
    }

    fn binding_for(&self, local: SocketAddr, socket: Arc<UdpSocket>) -> SocketBinding {
        SocketBinding {
            local,
            socket,
            send_lock: self.send_lock_for(local),
            transport: self.self_ref.lock().clone(),
            released: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn send_lock_for(&self, local: SocketAddr) -> Arc<tokio::sync::Mutex<()>> {
        self.send_locks
            .lock()
            .entry(local)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn install(&self, local: SocketAddr, socket: Arc<UdpSocket>, exclusive: bool) {
        let inbound_tx = self.inbound_tx.clone();
        let metrics = self.metrics.clone();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            run_recv_loop(local, recv_socket, inbound_tx, metrics).await;
        });
        self.pool.lock().insert(
            local,
            PoolEntry {
                socket,
                refs: 1,
                exclusive,
                linger_until: None,
                recv_task,
            },
        );
    }

    fn release(&self, local: SocketAddr) {
        let start_linger = {
            let mut pool = self.pool.lock();
            match pool.get_mut(&local) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        entry.linger_until = Some(Instant::now() + self.linger);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if start_linger {
            let weak = self.self_ref.lock().clone();
            let linger = self.linger;
            // Bindings can drop during runtime teardown; no reaper then.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    if let Some(transport) = weak.upgrade() {
                        transport.reap(local);
                    }
                });
            }
        }
    }

    fn reap(&self, local: SocketAddr) {
        let mut pool = self.pool.lock();
        let due = matches!(
            pool.get(&local),
            Some(entry) if entry.refs == 0
                && entry.linger_until.map(|t| t <= Instant::now()).unwrap_or(false)
        );
        if due {
            if let Some(entry) = pool.remove(&local) {
                entry.recv_task.abort();
                debug!(%local, "closed lingering socket");
            }
            self.send_locks.lock().remove(&local);
        }
    }
}

async fn run_recv_loop(
    local: SocketAddr,
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<InboundPacket>,
    metrics: Arc<dyn StackMetrics>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                if n == buf.len() {
                    warn!(%peer, max = n, "udp datagram likely truncated (buffer full)");
                }
                metrics.on_packet_received();
                stack_metrics().on_packet_received();
                let packet = InboundPacket {
                    peer,
                    local,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if inbound_tx.send(packet).await.is_err() {
                    error!(%local, "inbound consumer dropped; stopping recv loop");
                    break;
                }
            }
            Err(e) => {
                // Linux surfaces ICMP errors from earlier sends here; they
                // are not fatal for the socket.
                debug!(%local, %e, "udp recv_from error");
            }
        }
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn send_datagram(
    socket: &UdpSocket,
    dest: SocketAddr,
    payload: &[u8],
) -> Result<(), TransportError> {
    match socket.send_to(payload, dest).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tokio::time::sleep(EAGAIN_RETRY_DELAY).await;
            socket
                .send_to(payload, dest)
                .await
                .map(|_| ())
                .map_err(classify_send_error)
        }
        Err(e) => Err(classify_send_error(e)),
    }
}

fn classify_send_error(e: io::Error) -> TransportError {
    match e.raw_os_error() {
        Some(ENETUNREACH) | Some(EHOSTUNREACH) => TransportError::Unreachable(e),
        _ if e.kind() == io::ErrorKind::ConnectionRefused => TransportError::Unreachable(e),
        _ => TransportError::SendFailed(e),
    }
}
