// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Station-side helpers for the self tests: pull a snapshot, receive realtime
//! datagrams.

use anyhow::Context;
use hmon::transport::datagram::{self, DatagramError};
use hmon::transport::RealtimePacket;
use hmon::Commander;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// Receive buffer, matches the default datagram limit
const RECV_BUFFER: usize = 16_000;

/// Address a local client should dial for a listener bound to `bound`.
pub fn dial_address(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::from((Ipv4Addr::LOCALHOST, bound.port())),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::from((Ipv6Addr::LOCALHOST, bound.port())),
        _ => bound,
    }
}

/// Connect, read the whole reply, decrypt it when a commander is given.
pub fn pull(
    addr: SocketAddr,
    commander: Option<&Commander>,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("connect to {}", addr))?;
    stream.set_read_timeout(Some(timeout))?;

    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .with_context(|| format!("read from {}", addr))?;

    match commander {
        Some(commander) => commander
            .decode(&reply)
            .with_context(|| format!("decrypt {} byte reply", reply.len())),
        None => Ok(reply),
    }
}

/// Realtime receiver standing in for a monitoring station.
pub struct Receiver {
    socket: UdpSocket,
    commander: Option<Commander>,
    buf: Vec<u8>,
}

impl Receiver {
    /// Listen on loopback `port`.
    pub fn bind(port: u16, password: Option<&str>, poll: Duration) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("bind realtime receiver on port {}", port))?;
        socket.set_read_timeout(Some(poll))?;
        Ok(Self {
            socket,
            commander: password.map(Commander::new),
            buf: vec![0u8; RECV_BUFFER],
        })
    }

    /// Bound port.
    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Next datagram, `Ok(None)` when the poll interval passes without one.
    pub fn next(&mut self) -> anyhow::Result<Option<Result<RealtimePacket, DatagramError>>> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, _)) => Ok(Some(datagram::open(
                &self.buf[..len],
                self.commander.as_ref(),
            ))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e).context("receive datagram"),
        }
    }
}
