// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service lifecycle.
//!
//! ```text
//!            start              pause
//! Created ---------> Running ---------> Paused
//!    ^                |   ^               |
//!    |           stop |   +-- continue ---+
//!    |                v                   | stop
//!    +--- start -- Stopped <--------------+
//!
//! any state -- shutdown --> Shutdown (terminal)
//! ```
//!
//! A running processor owns three threads: the collection timer, the pull
//! listener and (when enabled) the realtime sender. Every transition that
//! leaves `Running`/`Paused` joins all three before returning.

use crate::config::AgentConfig;
use crate::crypto::Commander;
use crate::error::Result;
use crate::sections::{render_sections, seconds_since_epoch, SectionRegistry};
use crate::transport::{Device, DeviceState, ExternalPort, PortConfig, ReplyFn};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Periodic owner hook, called after every collection.
///
/// `Ok(false)` and `Err` are logged; neither stops the timer. Must not block
/// for long: the next collection waits for it.
pub type CollectCallback = Box<dyn FnMut(&Snapshot) -> Result<bool> + Send>;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, never started.
    Created,
    /// Transports up, timer collecting.
    Running,
    /// Transports up, timer suspended.
    Paused,
    /// Everything joined; may be started again.
    Stopped,
    /// Torn down for good.
    Shutdown,
}

/// One completed collection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Monotonic cycle counter, starting at 1.
    pub generation: u64,
    /// Seconds since epoch when the cycle finished.
    pub collected_at: u64,
    /// Rendered pull sections.
    pub text: String,
}

/// Top-level agent service.
pub struct ServiceProcessor {
    config: AgentConfig,
    port: ExternalPort,
    realtime: Option<Arc<RealtimeArm>>,
    collector: Arc<Collector>,
    timer: Arc<TimerControl>,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: ServiceState,
    timer: Option<JoinHandle<()>>,
}

struct TimerControl {
    flags: Mutex<TimerFlags>,
    cond: Condvar,
}

struct TimerFlags {
    stop: bool,
    paused: bool,
}

// ============================================================================
// Collection
// ============================================================================

struct Collector {
    registry: Arc<dyn SectionRegistry>,
    sections: Vec<String>,
    snapshot: ArcSwapOption<Snapshot>,
    generation: AtomicU64,
    callback: Mutex<CollectCallback>,
    callbacks: AtomicU64,
}

impl Collector {
    fn collect(&self) -> Arc<Snapshot> {
        let text = render_sections(&*self.registry, &self.sections);
        let snapshot = Arc::new(Snapshot {
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            collected_at: seconds_since_epoch(),
            text,
        });

        // never replace a newer cycle with an older one
        self.snapshot.rcu(|current| match current {
            Some(current) if current.generation > snapshot.generation => Some(Arc::clone(current)),
            _ => Some(Arc::clone(&snapshot)),
        });
        snapshot
    }

    fn latest(&self) -> Arc<Snapshot> {
        match self.snapshot.load_full() {
            Some(snapshot) => snapshot,
            None => self.collect(),
        }
    }

    fn tick(&self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let snapshot = self.collect();
            let mut callback = self.callback.lock();
            let hook: &mut (dyn FnMut(&Snapshot) -> Result<bool> + Send) = &mut **callback;
            self.callbacks.fetch_add(1, Ordering::AcqRel);
            hook(snapshot.as_ref()).map(|keep| (snapshot.generation, keep))
        }));

        match outcome {
            Ok(Ok((_, true))) => {}
            Ok(Ok((generation, false))) => {
                log::debug!("[SVC] callback declined generation {}", generation);
            }
            Ok(Err(e)) => log::warn!("[SVC] callback failed: {}", e),
            Err(_) => log::error!("[SVC] collection cycle panicked"),
        }
    }
}

/// Points the realtime device at whoever pulled last.
struct RealtimeArm {
    device: Device,
    port: u16,
    sections: Vec<String>,
    secret: Option<Zeroizing<String>>,
    timeout: Duration,
}

impl RealtimeArm {
    fn arm(&self, peer: IpAddr) {
        let host = peer.to_canonical().to_string();
        let secret = self.secret.as_deref().map(String::as_str);
        if let Err(e) =
            self.device
                .connect_from(&host, self.port, &self.sections, secret, self.timeout)
        {
            log::warn!("[SVC] realtime toward {} not armed: {}", host, e);
        }
    }
}

fn run_timer(timer: &TimerControl, collector: &Collector, delay: Duration) {
    let mut flags = timer.flags.lock();
    log::debug!("[SVC] collection timer started ({:?})", delay);

    loop {
        if flags.stop {
            break;
        }
        if flags.paused {
            timer.cond.wait(&mut flags);
            continue;
        }

        MutexGuard::unlocked(&mut flags, || collector.tick());

        let deadline = Instant::now() + delay;
        while !flags.stop && !flags.paused {
            if timer.cond.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
    }

    log::debug!("[SVC] collection timer stopped");
}

// ============================================================================
// Service Processor
// ============================================================================

impl ServiceProcessor {
    /// Validate `config` and build the (stopped) transports.
    pub fn new<F>(config: AgentConfig, registry: Arc<dyn SectionRegistry>, callback: F) -> Result<Self>
    where
        F: FnMut(&Snapshot) -> Result<bool> + Send + 'static,
    {
        config.validate()?;

        let mut port = ExternalPort::new(PortConfig::from(&config.global));
        if let Some(secret) = config.global.secret() {
            port = port.with_commander(Arc::new(Commander::new(secret)));
        }

        let realtime = config.realtime.enabled.then(|| {
            let device = Device::new(Arc::clone(&registry))
                .with_interval(config.realtime.interval())
                .with_max_datagram(config.realtime.max_datagram);
            Arc::new(RealtimeArm {
                device,
                port: config.realtime.port,
                sections: config.realtime.sections.clone(),
                secret: config
                    .realtime_secret()
                    .map(|s| Zeroizing::new(s.to_string())),
                timeout: config.realtime.timeout(),
            })
        });

        let collector = Arc::new(Collector {
            registry,
            sections: config.global.sections.clone(),
            snapshot: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            callback: Mutex::new(Box::new(callback)),
            callbacks: AtomicU64::new(0),
        });

        Ok(Self {
            config,
            port,
            realtime,
            collector,
            timer: Arc::new(TimerControl {
                flags: Mutex::new(TimerFlags {
                    stop: false,
                    paused: false,
                }),
                cond: Condvar::new(),
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: ServiceState::Created,
                timer: None,
            }),
        })
    }

    /// Configuration the processor was built with.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.lifecycle.lock().state
    }

    /// Latest completed collection, if any.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.collector.snapshot.load_full()
    }

    /// Owner callback invocations since creation.
    pub fn callbacks_run(&self) -> u64 {
        self.collector.callbacks.load(Ordering::Acquire)
    }

    /// Pull listener address while it runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.port.local_addr()
    }

    /// Pull listener.
    pub fn port(&self) -> &ExternalPort {
        &self.port
    }

    /// Realtime device state, `None` when realtime is disabled.
    pub fn realtime_state(&self) -> Option<DeviceState> {
        self.realtime.as_ref().map(|rt| rt.device.state())
    }

    /// `Created`/`Stopped` to `Running`.
    ///
    /// A pull listener that fails to bind is logged and the service runs
    /// without it. Any other state is returned unchanged.
    pub fn start_service(&self) -> ServiceState {
        let mut life = self.lifecycle.lock();
        match life.state {
            ServiceState::Created | ServiceState::Stopped => {}
            current => {
                log::debug!("[SVC] start ignored in state {:?}", current);
                return current;
            }
        }

        {
            let mut flags = self.timer.flags.lock();
            flags.stop = false;
            flags.paused = false;
        }
        let timer = Arc::clone(&self.timer);
        let collector = Arc::clone(&self.collector);
        let delay = self.config.main.delay();
        let spawned = thread::Builder::new()
            .name("hmon-collect".to_string())
            .spawn(move || run_timer(&timer, &collector, delay));
        match spawned {
            Ok(handle) => life.timer = Some(handle),
            Err(e) => {
                log::error!("[SVC] cannot start collection timer: {}", e);
                return life.state;
            }
        }

        if self.port.default_port() == 0 {
            log::info!("[SVC] pull channel disabled");
        } else if let Err(e) = self.port.start_io(self.reply_fn()) {
            log::error!("[SVC] pull channel unavailable: {}", e);
        }

        if let Some(rt) = &self.realtime {
            if let Err(e) = rt.device.start() {
                log::error!("[SVC] realtime channel unavailable: {}", e);
            }
        }

        life.state = ServiceState::Running;
        log::info!("[SVC] running");
        life.state
    }

    /// `Running`/`Paused` to `Stopped`, joining every thread.
    pub fn stop_service(&self) -> ServiceState {
        let mut life = self.lifecycle.lock();
        match life.state {
            ServiceState::Running | ServiceState::Paused => {
                self.teardown(&mut life);
                life.state = ServiceState::Stopped;
                log::info!("[SVC] stopped");
            }
            current => log::debug!("[SVC] stop ignored in state {:?}", current),
        }
        life.state
    }

    /// Suspend collection; the pull listener keeps answering.
    pub fn pause_service(&self) -> ServiceState {
        let mut life = self.lifecycle.lock();
        if life.state == ServiceState::Running {
            self.timer.flags.lock().paused = true;
            self.timer.cond.notify_all();
            life.state = ServiceState::Paused;
            log::info!("[SVC] paused");
        }
        life.state
    }

    /// Resume collection after a pause.
    pub fn continue_service(&self) -> ServiceState {
        let mut life = self.lifecycle.lock();
        if life.state == ServiceState::Paused {
            self.timer.flags.lock().paused = false;
            self.timer.cond.notify_all();
            life.state = ServiceState::Running;
            log::info!("[SVC] resumed");
        }
        life.state
    }

    /// Tear everything down from any state. Terminal.
    pub fn shutdown_service(&self) -> ServiceState {
        let mut life = self.lifecycle.lock();
        if life.state != ServiceState::Shutdown {
            self.teardown(&mut life);
            life.state = ServiceState::Shutdown;
            log::info!("[SVC] shut down");
        }
        life.state
    }

    fn teardown(&self, life: &mut Lifecycle) {
        self.timer.flags.lock().stop = true;
        self.timer.cond.notify_all();
        if let Some(handle) = life.timer.take() {
            if handle.join().is_err() {
                log::error!("[SVC] collection timer panicked");
            }
        }

        self.port.shutdown_io();
        if let Some(rt) = &self.realtime {
            rt.device.stop();
        }
    }

    fn reply_fn(&self) -> ReplyFn {
        let collector = Arc::clone(&self.collector);
        let realtime = self.realtime.clone();
        Arc::new(move |peer| {
            if let Some(rt) = &realtime {
                rt.arm(peer);
            }
            collector.latest().text.clone().into_bytes()
        })
    }
}

impl Drop for ServiceProcessor {
    fn drop(&mut self) {
        self.shutdown_service();
    }
}
