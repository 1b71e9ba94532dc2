// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic

//! Service lifecycle end to end: both transports, the collection timer and
//! the controller.
//!
//! TCP ports 64371-64380 are reserved for this file.

use hmon::sections::SectionSet;
use hmon::transport::datagram;
use hmon::{
    AgentConfig, Commander, DeviceState, Error, ServiceController, ServiceProcessor, ServiceState,
};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn config(port: u16) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.global.port = port;
    config.global.bind_address = "127.0.0.1".parse().expect("ip");
    config.global.sections = vec!["check".to_string(), "mem".to_string()];
    config.main.delay_ms = 25;
    config
}

fn registry() -> Arc<SectionSet> {
    Arc::new(
        SectionSet::new()
            .with_static("check", "Version: test")
            .with_static("mem", "MemTotal: 1024 kB"),
    )
}

fn pull(addr: SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT).expect("connect");
    stream.set_read_timeout(Some(IO_TIMEOUT)).expect("timeout");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read");
    buf
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_lifecycle_start_stop_restart() {
    let svc = ServiceProcessor::new(config(64371), registry(), |_| Ok(true)).expect("new");
    assert_eq!(svc.state(), ServiceState::Created);

    assert_eq!(svc.start_service(), ServiceState::Running);
    assert_eq!(svc.start_service(), ServiceState::Running);
    let addr = svc.local_addr().expect("listening");

    let text = String::from_utf8(pull(addr)).expect("utf8");
    assert_eq!(text, "<<<check>>>\nVersion: test\n<<<mem>>>\nMemTotal: 1024 kB\n");

    assert_eq!(svc.stop_service(), ServiceState::Stopped);
    assert_eq!(svc.stop_service(), ServiceState::Stopped);
    assert_eq!(svc.local_addr(), None);
    assert!(!svc.port().has_io_thread());

    assert_eq!(svc.start_service(), ServiceState::Running);
    let addr = svc.local_addr().expect("listening again");
    assert!(!pull(addr).is_empty());
    assert_eq!(svc.shutdown_service(), ServiceState::Shutdown);
}

#[test]
fn test_timer_refreshes_snapshot_and_calls_back() {
    let seen = Arc::new(AtomicU64::new(0));
    let seen_cb = seen.clone();
    let svc = ServiceProcessor::new(config(64372), registry(), move |snapshot| {
        seen_cb.store(snapshot.generation, Ordering::SeqCst);
        Ok(true)
    })
    .expect("new");

    svc.start_service();
    assert!(wait_until(Duration::from_secs(3), || svc.callbacks_run() >= 3));

    let snapshot = svc.snapshot().expect("snapshot");
    assert!(snapshot.generation >= 3);
    assert!(snapshot.text.starts_with("<<<check>>>\n"));
    assert!(seen.load(Ordering::SeqCst) >= 3);
    svc.stop_service();
}

#[test]
fn test_pause_suspends_callbacks_but_keeps_answering() {
    let svc = ServiceProcessor::new(config(64373), registry(), |_| Ok(true)).expect("new");
    svc.start_service();
    assert!(wait_until(Duration::from_secs(3), || svc.callbacks_run() >= 1));

    assert_eq!(svc.pause_service(), ServiceState::Paused);
    assert_eq!(svc.pause_service(), ServiceState::Paused);
    // let a tick that raced the pause finish
    thread::sleep(Duration::from_millis(100));
    let paused_at = svc.callbacks_run();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(svc.callbacks_run(), paused_at);

    let addr = svc.local_addr().expect("listening");
    assert!(!pull(addr).is_empty());

    assert_eq!(svc.continue_service(), ServiceState::Running);
    assert!(wait_until(Duration::from_secs(3), || svc.callbacks_run() > paused_at));

    // stop from paused is allowed too
    svc.pause_service();
    assert_eq!(svc.stop_service(), ServiceState::Stopped);
}

#[test]
fn test_failing_and_panicking_callback_keeps_timer_alive() {
    let calls = Arc::new(AtomicU64::new(0));
    let calls_cb = calls.clone();
    let svc = ServiceProcessor::new(config(64374), registry(), move |_| {
        match calls_cb.fetch_add(1, Ordering::SeqCst) {
            0 => Err(Error::Callback("collector offline".to_string())),
            1 => panic!("callback bug"),
            2 => Ok(false),
            _ => Ok(true),
        }
    })
    .expect("new");

    svc.start_service();
    assert!(wait_until(Duration::from_secs(3), || calls.load(Ordering::SeqCst) >= 5));
    assert_eq!(svc.state(), ServiceState::Running);
    assert_eq!(svc.stop_service(), ServiceState::Stopped);
}

#[test]
fn test_encrypted_pull() {
    let mut config = config(64375);
    config.global.encrypted = true;
    config.global.passphrase = "axecerc".to_string();

    let svc = ServiceProcessor::new(config, registry(), |_| Ok(true)).expect("new");
    svc.start_service();
    let envelope = pull(svc.local_addr().expect("listening"));

    let plain = Commander::new("axecerc").decode(&envelope).expect("decode");
    assert!(plain.starts_with(b"<<<check>>>\n"));
}

#[test]
fn test_pull_arms_realtime_toward_station() {
    let station = UdpSocket::bind("127.0.0.1:0").expect("bind");
    station.set_read_timeout(Some(IO_TIMEOUT)).expect("timeout");

    let mut config = config(64376);
    config.global.passphrase = "axecerc".to_string();
    config.realtime.enabled = true;
    config.realtime.port = station.local_addr().expect("addr").port();
    config.realtime.encrypted = true;
    config.realtime.sections = vec!["mem".to_string()];
    config.realtime.interval_ms = 50;

    let svc = ServiceProcessor::new(config, registry(), |_| Ok(true)).expect("new");
    svc.start_service();
    assert_eq!(svc.realtime_state(), Some(DeviceState::Idle));

    // plain pull, encrypted push: the flags are independent
    assert!(pull(svc.local_addr().expect("listening")).starts_with(b"<<<check>>>"));
    assert_eq!(svc.realtime_state(), Some(DeviceState::Connected));

    let mut buf = vec![0u8; 16_000];
    let (len, _) = station.recv_from(&mut buf).expect("datagram");
    let commander = Commander::new("axecerc");
    let packet = datagram::open(&buf[..len], Some(&commander)).expect("open");
    assert_eq!(packet.payload, b"<<<mem>>>\nMemTotal: 1024 kB\n");

    svc.stop_service();
    assert_eq!(svc.realtime_state(), Some(DeviceState::Idle));
}

#[test]
fn test_longest_realtime_timeout_keeps_pull_whole() {
    let station = UdpSocket::bind("127.0.0.1:0").expect("bind");
    let mut config = config(64380);
    config.realtime.enabled = true;
    config.realtime.port = station.local_addr().expect("addr").port();
    config.realtime.sections = vec!["mem".to_string()];
    config.realtime.timeout_secs = hmon::config::MAX_REALTIME_TIMEOUT_SECS;

    let svc = ServiceProcessor::new(config.clone(), registry(), |_| Ok(true)).expect("new");
    svc.start_service();
    let reply = pull(svc.local_addr().expect("listening"));
    assert_eq!(
        reply,
        b"<<<check>>>\nVersion: test\n<<<mem>>>\nMemTotal: 1024 kB\n"
    );
    assert_eq!(svc.realtime_state(), Some(DeviceState::Connected));
    svc.stop_service();

    config.realtime.timeout_secs = u64::MAX;
    assert!(matches!(
        ServiceProcessor::new(config, registry(), |_| Ok(true)),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_disabled_port_still_runs_timer() {
    let svc = ServiceProcessor::new(config(0), registry(), |_| Ok(true)).expect("new");
    assert_eq!(svc.start_service(), ServiceState::Running);
    assert_eq!(svc.local_addr(), None);
    assert!(wait_until(Duration::from_secs(3), || svc.callbacks_run() >= 1));
    assert_eq!(svc.stop_service(), ServiceState::Stopped);
}

#[test]
fn test_stop_after_partial_start() {
    let _occupier = TcpListener::bind("127.0.0.1:64377").expect("occupy");
    let svc = ServiceProcessor::new(config(64377), registry(), |_| Ok(true)).expect("new");

    assert_eq!(svc.start_service(), ServiceState::Running);
    assert_eq!(svc.local_addr(), None);
    assert_eq!(svc.stop_service(), ServiceState::Stopped);
}

#[test]
fn test_controller_drives_processor() {
    let svc = Arc::new(ServiceProcessor::new(config(64378), registry(), |_| Ok(true)).expect("new"));
    let controller = ServiceController::new(svc.clone());
    let handle = controller.handle();
    let runner = thread::spawn(move || controller.run());

    assert!(wait_until(Duration::from_secs(3), || svc.state() == ServiceState::Running));
    assert!(handle.pause());
    assert!(wait_until(Duration::from_secs(3), || svc.state() == ServiceState::Paused));
    assert!(handle.resume());
    assert!(wait_until(Duration::from_secs(3), || svc.state() == ServiceState::Running));
    assert!(handle.stop());

    assert_eq!(runner.join().expect("controller"), ServiceState::Stopped);
    assert_eq!(svc.state(), ServiceState::Stopped);
    assert!(!svc.port().has_io_thread());
}

#[test]
fn test_drop_tears_down_listener() {
    let addr = {
        let svc = ServiceProcessor::new(config(64379), registry(), |_| Ok(true)).expect("new");
        svc.start_service();
        svc.local_addr().expect("listening")
    };
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
}
