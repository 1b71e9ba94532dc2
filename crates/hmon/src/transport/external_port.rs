// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pull channel: single-flight TCP request/reply listener.
//!
//! A station connects, the agent writes one complete payload and closes. The
//! connect itself is the request; nothing is read from the peer.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     hmon-port-io thread                      |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - TCP Listener (accept, one connection at a time)    |  |
//! |  |  - In-flight stream (WRITABLE until payload drained)  |  |
//! |  |  - Waker (shutdown_io from the control thread)        |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                               |
//! |                              v                               |
//! |  +-------------+    +-------------+    +-----------------+  |
//! |  |   Accept    | -> |  reply(ip)  | -> | encode + write  |  |
//! |  +-------------+    +-------------+    +-----------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Connections that arrive while a reply is in flight wait in the kernel
//! backlog; the listener is only drained once the current payload is written.
//!
//! There is no accept or write timeout. A peer that connects and never reads
//! holds the single reply slot until it goes away. Stations are trusted LAN
//! hosts; restrict `only_from` (or firewall the port) anywhere else.

use crate::config::GlobalConfig;
use crate::crypto::Commander;
use crate::error::{Error, Result};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

/// Token for the connection being answered
const CONNECTION_TOKEN: Token = Token(2);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 16;

/// Kernel accept backlog
const LISTEN_BACKLOG: i32 = 16;

/// Pause before polling again after a poll error
const POLL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive poll errors after which the accept loop gives up
const MAX_POLL_FAILURES: u32 = 50;

/// Produces the reply for a peer. Held by the port until `shutdown_io` returns.
pub type ReplyFn = Arc<dyn Fn(IpAddr) -> Vec<u8> + Send + Sync>;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// No listener, no thread.
    Stopped,
    /// Binding; only observable from inside `start_io`.
    Starting,
    /// Accept loop running.
    Listening,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// TCP port, 0 disables the listener.
    pub port: u16,
    /// Local address to bind.
    pub bind_address: IpAddr,
    /// Allowed peers; empty allows everyone.
    pub only_from: Vec<IpAddr>,
}

impl PortConfig {
    /// Listen on `port` on all IPv4 interfaces, open to every peer.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            only_from: Vec::new(),
        }
    }

    /// Bind a specific local address.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Only answer these peers.
    pub fn with_only_from(mut self, peers: Vec<IpAddr>) -> Self {
        self.only_from = peers;
        self
    }
}

impl From<&GlobalConfig> for PortConfig {
    fn from(global: &GlobalConfig) -> Self {
        Self {
            port: global.port,
            bind_address: global.bind_address,
            only_from: global.only_from.clone(),
        }
    }
}

// ============================================================================
// External Port
// ============================================================================

/// TCP pull listener owning at most one accept thread.
///
/// `start_io`/`shutdown_io` may be called from any thread; both serialize on an
/// internal lock.
pub struct ExternalPort {
    config: PortConfig,
    commander: Option<Arc<Commander>>,
    inner: Mutex<PortInner>,
    replies: Arc<AtomicU64>,
}

struct PortInner {
    state: PortState,
    io: Option<IoHandle>,
}

/// Running accept thread.
struct IoHandle {
    stop: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl IoHandle {
    /// True once the accept loop has returned, whoever asked it to.
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[PORT] I/O thread panicked");
            }
        }
    }
}

/// Raised when the accept loop returns or unwinds.
struct ExitFlag(Arc<AtomicBool>);

impl Drop for ExitFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl ExternalPort {
    /// Create a stopped port.
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            commander: None,
            inner: Mutex::new(PortInner {
                state: PortState::Stopped,
                io: None,
            }),
            replies: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Encrypt every reply with `commander`.
    pub fn with_commander(mut self, commander: Arc<Commander>) -> Self {
        self.commander = Some(commander);
        self
    }

    /// Configured port; 0 means the pull channel is disabled.
    pub fn default_port(&self) -> u16 {
        self.config.port
    }

    /// Current lifecycle state. An accept loop that ended on its own reads as
    /// `Stopped`.
    pub fn state(&self) -> PortState {
        let inner = self.inner.lock();
        match inner.io.as_ref() {
            Some(io) if io.has_exited() => PortState::Stopped,
            _ => inner.state,
        }
    }

    /// True while the accept loop runs.
    pub fn is_listening(&self) -> bool {
        self.state() == PortState::Listening
    }

    /// True while the port owns an unjoined I/O thread.
    pub fn has_io_thread(&self) -> bool {
        self.inner
            .lock()
            .io
            .as_ref()
            .is_some_and(|io| io.thread.is_some())
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .io
            .as_ref()
            .filter(|io| !io.has_exited())
            .map(|io| io.local_addr)
    }

    /// Number of reply function invocations since creation.
    pub fn replies_served(&self) -> u64 {
        self.replies.load(Ordering::Acquire)
    }

    /// Bind and start the accept loop.
    ///
    /// Fails without side effects if already listening or disabled. A bind
    /// failure leaves the port `Stopped`. A dead accept loop is joined and
    /// replaced.
    pub fn start_io(&self, reply: ReplyFn) -> Result<SocketAddr> {
        let mut inner = self.inner.lock();
        if inner.io.as_ref().is_some_and(IoHandle::has_exited) {
            if let Some(mut dead) = inner.io.take() {
                dead.join();
                log::warn!("[PORT] reaped exited accept loop on {}", dead.local_addr);
            }
            inner.state = PortState::Stopped;
        }
        if let Some(io) = inner.io.as_ref() {
            return Err(Error::InvalidState(format!(
                "external port already listening on {}",
                io.local_addr
            )));
        }
        if self.config.port == 0 {
            return Err(Error::Disabled("external port"));
        }

        inner.state = PortState::Starting;
        match self.spawn_io(reply) {
            Ok(io) => {
                let local_addr = io.local_addr;
                inner.io = Some(io);
                inner.state = PortState::Listening;
                log::info!("[PORT] listening on {}", local_addr);
                Ok(local_addr)
            }
            Err(e) => {
                inner.state = PortState::Stopped;
                log::error!("[PORT] start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the accept loop and join its thread.
    ///
    /// No reply function call happens after this returns. No-op when not
    /// listening.
    pub fn shutdown_io(&self) {
        let mut inner = self.inner.lock();
        let Some(mut io) = inner.io.take() else {
            return;
        };

        io.stop.store(true, Ordering::Release);
        if !io.has_exited() {
            if let Err(e) = io.waker.wake() {
                log::error!("[PORT] failed to wake I/O thread: {}", e);
            }
        }
        io.join();

        inner.state = PortState::Stopped;
        log::info!("[PORT] stopped listening on {}", io.local_addr);
    }

    fn spawn_io(&self, reply: ReplyFn) -> Result<IoHandle> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let std_listener =
            bind_listener(addr).map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = std_listener.local_addr()?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));

        let io_loop = PortLoop {
            poll,
            listener,
            reply,
            commander: self.commander.clone(),
            only_from: self.config.only_from.clone(),
            stop: Arc::clone(&stop),
            exited: Arc::clone(&exited),
            in_flight: None,
            replies: Arc::clone(&self.replies),
        };

        let thread = thread::Builder::new()
            .name("hmon-port-io".to_string())
            .spawn(move || io_loop.run())?;

        Ok(IoHandle {
            stop,
            exited,
            waker,
            thread: Some(thread),
            local_addr,
        })
    }
}

impl Drop for ExternalPort {
    fn drop(&mut self) {
        self.shutdown_io();
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Windows SO_REUSEADDR lets another process steal the port
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

// ============================================================================
// Accept Loop
// ============================================================================

struct PortLoop {
    poll: Poll,
    listener: TcpListener,
    reply: ReplyFn,
    commander: Option<Arc<Commander>>,
    only_from: Vec<IpAddr>,
    stop: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    in_flight: Option<InFlight>,
    replies: Arc<AtomicU64>,
}

/// Reply being written to a peer that did not take it in one write.
struct InFlight {
    stream: TcpStream,
    peer: SocketAddr,
    payload: Vec<u8>,
    offset: usize,
}

impl InFlight {
    /// Write until drained (`true`) or the socket would block (`false`).
    fn write_some(&mut self) -> io::Result<bool> {
        while self.offset < self.payload.len() {
            match self.stream.write(&self.payload[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.offset += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn finish(self) {
        log::debug!("[PORT] sent {} bytes to {}", self.payload.len(), self.peer);
        close(&self.stream);
    }
}

impl PortLoop {
    fn run(mut self) {
        let _exit = ExitFlag(Arc::clone(&self.exited));
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut poll_failures = 0u32;
        log::debug!("[PORT] I/O thread started");

        while !self.stop_requested() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                poll_failures += 1;
                if poll_failures >= MAX_POLL_FAILURES {
                    log::error!(
                        "[PORT] poll failed {} times in a row, accept loop exits: {}",
                        poll_failures,
                        e
                    );
                    break;
                }
                log::warn!("[PORT] poll failed, retrying: {}", e);
                thread::sleep(POLL_RETRY_DELAY);
                continue;
            }
            poll_failures = 0;
            if self.stop_requested() {
                break;
            }

            let writable = events.iter().any(|e| e.token() == CONNECTION_TOKEN);
            if writable {
                self.flush();
            }
            // the listener is edge-triggered: drain it whenever the slot is free
            if self.in_flight.is_none() {
                self.accept_pending();
            }
        }

        if let Some(conn) = self.in_flight.take() {
            log::debug!(
                "[PORT] dropping reply to {} at {}/{} bytes",
                conn.peer,
                conn.offset,
                conn.payload.len()
            );
        }
        log::debug!("[PORT] I/O thread stopped");
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn accept_pending(&mut self) {
        while self.in_flight.is_none() && !self.stop_requested() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.serve(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[PORT] accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn is_allowed(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.only_from.is_empty() || self.only_from.iter().any(|ip| ip.to_canonical() == peer)
    }

    fn serve(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.is_allowed(peer.ip()) {
            log::info!("[PORT] {} not in only_from, closing", peer);
            close(&stream);
            return;
        }

        let reply = Arc::clone(&self.reply);
        let payload = match panic::catch_unwind(AssertUnwindSafe(|| reply(peer.ip()))) {
            Ok(payload) => payload,
            Err(_) => {
                log::error!("[PORT] reply function panicked for {}", peer);
                close(&stream);
                return;
            }
        };
        self.replies.fetch_add(1, Ordering::AcqRel);

        let payload = match &self.commander {
            Some(commander) => match commander.encode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::error!("[PORT] cannot encrypt reply for {}: {}", peer, e);
                    close(&stream);
                    return;
                }
            },
            None => payload,
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[PORT] set_nodelay failed for {}: {}", peer, e);
        }

        let mut conn = InFlight {
            stream,
            peer,
            payload,
            offset: 0,
        };
        match conn.write_some() {
            Ok(true) => conn.finish(),
            Ok(false) => {
                match self
                    .poll
                    .registry()
                    .register(&mut conn.stream, CONNECTION_TOKEN, Interest::WRITABLE)
                {
                    Ok(()) => self.in_flight = Some(conn),
                    Err(e) => log::warn!("[PORT] cannot register {}: {}", peer, e),
                }
            }
            Err(e) => log::debug!("[PORT] write to {} failed: {}", peer, e),
        }
    }

    fn flush(&mut self) {
        let Some(mut conn) = self.in_flight.take() else {
            return;
        };

        match conn.write_some() {
            Ok(false) => self.in_flight = Some(conn),
            Ok(true) => {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                conn.finish();
            }
            Err(e) => {
                log::debug!("[PORT] write to {} failed: {}", conn.peer, e);
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }
}

fn close(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(ExternalPort::new(PortConfig::new(0)).default_port(), 0);
        assert_eq!(ExternalPort::new(PortConfig::new(555)).default_port(), 555);
    }

    #[test]
    fn test_disabled_port_refuses_start() {
        let port = ExternalPort::new(PortConfig::new(0));
        let reply: ReplyFn = Arc::new(|_| Vec::new());
        assert!(matches!(port.start_io(reply), Err(Error::Disabled(_))));
        assert_eq!(port.state(), PortState::Stopped);
        assert!(!port.has_io_thread());
    }

    #[test]
    fn test_shutdown_without_start_is_noop() {
        let port = ExternalPort::new(PortConfig::new(6556));
        port.shutdown_io();
        port.shutdown_io();
        assert_eq!(port.state(), PortState::Stopped);
    }

    #[test]
    fn test_exited_loop_reads_stopped_and_restarts() {
        let port = ExternalPort::new(
            PortConfig::new(64363).with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        );
        let reply: ReplyFn = Arc::new(|_| b"back".to_vec());
        port.start_io(reply.clone()).unwrap();

        // end the loop behind the port's back, as a fatal poll error would
        {
            let inner = port.inner.lock();
            let io = inner.io.as_ref().unwrap();
            io.stop.store(true, Ordering::Release);
            io.waker.wake().unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while port.is_listening() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(port.state(), PortState::Stopped);
        assert_eq!(port.local_addr(), None);
        assert!(port.has_io_thread());

        let addr = port.start_io(reply).unwrap();
        assert!(port.is_listening());
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut buf).unwrap();
        assert_eq!(buf, b"back");
    }

    #[test]
    fn test_port_config_from_global() {
        let global = GlobalConfig {
            port: 7001,
            only_from: vec!["10.0.0.1".parse().unwrap()],
            ..GlobalConfig::default()
        };
        let config = PortConfig::from(&global);
        assert_eq!(config.port, 7001);
        assert_eq!(config.only_from, global.only_from);
    }
}
