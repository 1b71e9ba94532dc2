// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service lifecycle and its external control surface.

mod controller;
mod processor;

pub use controller::{ControlHandle, ControlRequest, ServiceControl, ServiceController};
pub use processor::{CollectCallback, ServiceProcessor, ServiceState, Snapshot};
