// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery channels.
//!
//! - [`ExternalPort`]: TCP pull, one connection answered at a time
//! - [`Device`]: UDP realtime push to the last station that pulled
//! - [`datagram`]: realtime frame codec shared by sender and receivers

pub mod datagram;
mod external_port;
mod realtime;

pub use datagram::{DatagramError, RealtimePacket};
pub use external_port::{ExternalPort, PortConfig, PortState, ReplyFn};
pub use realtime::{Device, DeviceState};
