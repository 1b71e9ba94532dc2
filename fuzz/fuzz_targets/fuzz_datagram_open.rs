// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use hmon::transport::datagram;
use hmon::Commander;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

static COMMANDER: OnceLock<Commander> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let commander = COMMANDER.get_or_init(|| Commander::new("fuzz"));

    if let Ok(frame) = datagram::parse(data) {
        assert_eq!(frame.body.len(), data.len() - datagram::DATA_OFFSET);
    }
    let _ = datagram::open(data, None);
    let _ = datagram::open(data, Some(commander));
});
