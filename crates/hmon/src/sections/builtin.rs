// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal built-in providers.
//!
//! Enough for a station to identify the host and see that the agent is
//! alive. Real telemetry plugs in through [`SectionProvider`].

use super::{SectionError, SectionProvider};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Agent identification: version, OS and hostname.
#[derive(Debug, Clone)]
pub struct CheckMkSection {
    hostname: String,
}

impl CheckMkSection {
    /// Capture the hostname once.
    pub fn new() -> Self {
        Self {
            hostname: hostname(),
        }
    }
}

impl Default for CheckMkSection {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionProvider for CheckMkSection {
    fn name(&self) -> &str {
        "check_mk"
    }

    fn body(&self) -> Result<String, SectionError> {
        Ok(format!(
            "Version: {}\nAgentOS: {}\nHostname: {}\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            self.hostname
        ))
    }
}

/// Wall clock as seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSection;

impl SectionProvider for SystemTimeSection {
    fn name(&self) -> &str {
        "systemtime"
    }

    fn body(&self) -> Result<String, SectionError> {
        Ok(seconds_since_epoch().to_string())
    }
}

/// Host uptime in seconds.
///
/// Reads `/proc/uptime` where it exists, otherwise reports agent uptime.
#[derive(Debug, Clone)]
pub struct UptimeSection {
    started: Instant,
}

impl UptimeSection {
    /// Start the fallback clock now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for UptimeSection {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionProvider for UptimeSection {
    fn name(&self) -> &str {
        "uptime"
    }

    fn body(&self) -> Result<String, SectionError> {
        let host_uptime = std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|first| first.parse::<f64>().ok());

        let secs = match host_uptime {
            Some(secs) if secs >= 0.0 => secs as u64,
            _ => self.started.elapsed().as_secs(),
        };
        Ok(secs.to_string())
    }
}

/// Memory counters, passed through from `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemSection;

impl SectionProvider for MemSection {
    fn name(&self) -> &str {
        "mem"
    }

    fn body(&self) -> Result<String, SectionError> {
        std::fs::read_to_string("/proc/meminfo").map_err(|e| SectionError::Failed {
            name: "mem".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Seconds since the Unix epoch, 0 if the clock is before it.
pub(crate) fn seconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
