// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Realtime push channel.
//!
//! Once a station is known, a sender thread renders the realtime sections on
//! every tick and fires them at the station as one UDP datagram. Nothing is
//! acknowledged; a lost datagram is replaced by the next one.
//!
//! A session lives until its liveness deadline passes. Every `connect_from`
//! toward the same target pushes the deadline out again, so a station keeps
//! the stream alive by pulling periodically and it dies quietly when the
//! station goes away.

use crate::config::{DEFAULT_MAX_DATAGRAM, DEFAULT_REALTIME_INTERVAL_MS};
use crate::crypto::Commander;
use crate::error::{Error, Result};
use crate::sections::{render_sections, seconds_since_epoch, SectionRegistry};
use crate::transport::datagram;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Push channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No target; the sender thread, if any, is parked.
    Idle,
    /// Streaming to a target until the liveness deadline.
    Connected,
}

/// UDP realtime sender.
pub struct Device {
    registry: Arc<dyn SectionRegistry>,
    interval: Duration,
    max_datagram: usize,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<SenderState>,
    cond: Condvar,
    sent: AtomicU64,
}

struct SenderState {
    session: Option<Session>,
    stop: bool,
}

struct Session {
    target: SocketAddr,
    socket: Arc<UdpSocket>,
    sections: Arc<[String]>,
    secret: Option<Zeroizing<String>>,
    commander: Option<Arc<Commander>>,
    deadline: Instant,
}

impl Session {
    fn open(
        target: SocketAddr,
        sections: &[String],
        secret: Option<&str>,
        deadline: Instant,
    ) -> Result<Self> {
        let local = if target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local)?;

        Ok(Self {
            target,
            socket: Arc::new(socket),
            sections: sections.into(),
            secret: secret.map(|s| Zeroizing::new(s.to_string())),
            commander: secret.map(|s| Arc::new(Commander::new(s))),
            deadline,
        })
    }

    fn matches(&self, target: SocketAddr, sections: &[String], secret: Option<&str>) -> bool {
        self.target == target
            && *self.sections == *sections
            && self.secret.as_deref().map(String::as_str) == secret
    }

    fn tick(&self) -> Tick {
        Tick {
            target: self.target,
            socket: Arc::clone(&self.socket),
            sections: Arc::clone(&self.sections),
            commander: self.commander.clone(),
        }
    }
}

/// Everything one send needs, taken out of the lock.
struct Tick {
    target: SocketAddr,
    socket: Arc<UdpSocket>,
    sections: Arc<[String]>,
    commander: Option<Arc<Commander>>,
}

impl Tick {
    fn send(&self, registry: &dyn SectionRegistry, max_datagram: usize, sent: &AtomicU64) {
        let text = render_sections(registry, &self.sections[..]);
        let body = match &self.commander {
            Some(commander) => match commander.encode(text.as_bytes()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("[RT] cannot encrypt tick: {}", e);
                    return;
                }
            },
            None => text.into_bytes(),
        };

        let frame = datagram::encode(&body, self.commander.is_some(), seconds_since_epoch());
        if frame.len() > max_datagram {
            log::warn!(
                "[RT] datagram of {} bytes exceeds limit {}, tick dropped",
                frame.len(),
                max_datagram
            );
            return;
        }

        match self.socket.send_to(&frame, self.target) {
            Ok(_) => {
                sent.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => log::debug!("[RT] send to {} failed: {}", self.target, e),
        }
    }
}

impl Device {
    /// Idle device rendering sections from `registry`.
    pub fn new(registry: Arc<dyn SectionRegistry>) -> Self {
        Self {
            registry,
            interval: Duration::from_millis(DEFAULT_REALTIME_INTERVAL_MS),
            max_datagram: DEFAULT_MAX_DATAGRAM,
            shared: Arc::new(Shared {
                state: Mutex::new(SenderState {
                    session: None,
                    stop: false,
                }),
                cond: Condvar::new(),
                sent: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Tick period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Largest datagram put on the wire.
    pub fn with_max_datagram(mut self, max_datagram: usize) -> Self {
        self.max_datagram = max_datagram;
        self
    }

    /// Spawn the sender thread without a target. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = worker.take() {
            if finished.join().is_err() {
                log::error!("[RT] sender thread panicked");
            }
        }

        self.shared.state.lock().stop = false;
        let shared = Arc::clone(&self.shared);
        let registry = Arc::clone(&self.registry);
        let interval = self.interval;
        let max_datagram = self.max_datagram;
        let handle = thread::Builder::new()
            .name("hmon-rt-send".to_string())
            .spawn(move || run_sender(&shared, &*registry, interval, max_datagram))?;
        *worker = Some(handle);
        log::debug!("[RT] sender thread armed");
        Ok(())
    }

    /// Stream `sections` to `host:port` until `timeout` passes without another
    /// call for the same target.
    ///
    /// A different target, section list or secret replaces the session.
    pub fn connect_from(
        &self,
        host: &str,
        port: u16,
        sections: &[String],
        secret: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        if port == 0 {
            return Err(Error::Disabled("realtime target"));
        }
        if sections.is_empty() {
            return Err(Error::InvalidState("no realtime sections".to_string()));
        }
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            Error::InvalidState(format!("realtime timeout {:?} out of range", timeout))
        })?;
        let target = resolve(host, port)?;

        {
            let mut state = self.shared.state.lock();
            match state.session.as_mut() {
                Some(session) if session.matches(target, sections, secret) => {
                    session.deadline = deadline;
                    log::debug!("[RT] session to {} refreshed", target);
                }
                _ => {
                    state.session = Some(Session::open(target, sections, secret, deadline)?);
                    log::info!(
                        "[RT] streaming {:?} to {} (encrypted: {})",
                        sections,
                        target,
                        secret.is_some()
                    );
                }
            }
        }
        self.shared.cond.notify_all();
        self.start()
    }

    /// End the session and join the sender thread. Idempotent.
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            if let Some(session) = state.session.take() {
                log::info!("[RT] session to {} stopped", session.target);
            }
        }
        self.shared.cond.notify_all();

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                log::error!("[RT] sender thread panicked");
            }
        }
        self.shared.state.lock().stop = false;
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        if self.shared.state.lock().session.is_some() {
            DeviceState::Connected
        } else {
            DeviceState::Idle
        }
    }

    /// Current target, if connected.
    pub fn target(&self) -> Option<SocketAddr> {
        self.shared.state.lock().session.as_ref().map(|s| s.target)
    }

    /// Datagrams handed to the OS since creation.
    pub fn datagrams_sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Acquire)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{}:{}: no address", host, port)))
}

fn run_sender(
    shared: &Shared,
    registry: &dyn SectionRegistry,
    interval: Duration,
    max_datagram: usize,
) {
    let mut state = shared.state.lock();
    let mut next_tick = Instant::now();

    loop {
        if state.stop {
            break;
        }

        let Some(session) = state.session.as_ref() else {
            shared.cond.wait(&mut state);
            next_tick = Instant::now();
            continue;
        };

        let now = Instant::now();
        if now >= session.deadline {
            log::info!("[RT] session to {} expired", session.target);
            state.session = None;
            continue;
        }
        if now < next_tick {
            let wake = next_tick.min(session.deadline);
            shared.cond.wait_until(&mut state, wake);
            continue;
        }

        let tick = session.tick();
        MutexGuard::unlocked(&mut state, || {
            let sent = panic::catch_unwind(AssertUnwindSafe(|| {
                tick.send(registry, max_datagram, &shared.sent);
            }));
            if sent.is_err() {
                log::error!("[RT] section rendering panicked, tick dropped");
            }
        });
        next_tick = now + interval;
    }

    log::debug!("[RT] sender thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::SectionSet;

    fn device() -> Device {
        Device::new(Arc::new(SectionSet::new().with_static("mem", "1")))
    }

    #[test]
    fn test_new_device_is_idle() {
        let dev = device();
        assert_eq!(dev.state(), DeviceState::Idle);
        assert_eq!(dev.target(), None);
        assert_eq!(dev.datagrams_sent(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dev = device();
        dev.stop();
        dev.start().unwrap();
        dev.start().unwrap();
        dev.stop();
        dev.stop();
        assert_eq!(dev.state(), DeviceState::Idle);
    }

    #[test]
    fn test_connect_rejects_port_zero_and_empty_sections() {
        let dev = device();
        let sections = vec!["mem".to_string()];
        assert!(dev
            .connect_from("127.0.0.1", 0, &sections, None, Duration::from_secs(1))
            .is_err());
        assert!(dev
            .connect_from("127.0.0.1", 5555, &[], None, Duration::from_secs(1))
            .is_err());
        assert_eq!(dev.state(), DeviceState::Idle);
    }

    #[test]
    fn test_connect_rejects_unrepresentable_timeout() {
        let dev = device();
        let sections = vec!["mem".to_string()];
        let result = dev.connect_from("127.0.0.1", 5555, &sections, None, Duration::MAX);
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(dev.state(), DeviceState::Idle);
        assert!(dev.worker.lock().is_none());
    }

    #[test]
    fn test_session_matching() {
        let target: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let sections = vec!["mem".to_string()];
        let session = Session::open(target, &sections, Some("axecerc"), Instant::now()).unwrap();

        assert!(session.matches(target, &sections, Some("axecerc")));
        assert!(!session.matches(target, &sections, None));
        assert!(!session.matches(target, &sections, Some("other")));
        assert!(!session.matches(target, &["df".to_string()], Some("axecerc")));
    }
}
