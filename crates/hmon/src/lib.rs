// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hmon - host monitoring agent core
//!
//! Collects named telemetry sections on a timer and hands them to a
//! monitoring station over two channels: a TCP pull (connect, receive one
//! snapshot, disconnect) and a UDP realtime push to the station that pulled
//! last. Both channels can be encrypted with a shared passphrase.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hmon::{AgentConfig, SectionSet, ServiceProcessor};
//! use std::sync::Arc;
//!
//! fn main() -> hmon::Result<()> {
//!     let config = AgentConfig::from_file("hmon.yml")?;
//!     let service = ServiceProcessor::new(config, Arc::new(SectionSet::builtin()), |snapshot| {
//!         log::debug!("generation {}", snapshot.generation);
//!         Ok(true)
//!     })?;
//!
//!     service.start_service();
//!     // ... until the service manager says otherwise
//!     service.stop_service();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     ServiceProcessor                        |
//! |   lifecycle | collection timer | Snapshot (ArcSwap)         |
//! +-------------------------------------------------------------+
//! |        ExternalPort (TCP)        |    Device (UDP push)     |
//! |   mio accept loop, one reply     |   tick, frame, send_to   |
//! +-------------------------------------------------------------+
//! |                Commander (AES-256-GCM envelope)             |
//! +-------------------------------------------------------------+
//! |                SectionRegistry (collaborator)               |
//! +-------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ServiceProcessor`] | Lifecycle state machine owning both transports |
//! | [`ExternalPort`] | Single-flight TCP request/reply listener |
//! | [`Device`] | UDP realtime sender with liveness timeout |
//! | [`Commander`] | Shared-secret encrypt/decrypt |
//! | [`SectionRegistry`] | Source of rendered telemetry sections |
//! | [`AgentConfig`] | YAML configuration |

pub mod config;
pub mod crypto;
pub mod error;
pub mod sections;
pub mod service;
pub mod transport;

pub use config::{AgentConfig, ConfigError};
pub use crypto::{Commander, CryptoError};
pub use error::{Error, Result};
pub use sections::{SectionError, SectionProvider, SectionRegistry, SectionSet};
pub use service::{
    ControlHandle, ServiceControl, ServiceController, ServiceProcessor, ServiceState, Snapshot,
};
pub use transport::{Device, DeviceState, ExternalPort, PortConfig, PortState, ReplyFn};
