// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use hmon::Commander;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

static COMMANDER: OnceLock<Commander> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let commander = COMMANDER.get_or_init(|| Commander::new("fuzz"));

    // first byte picks a declared length, possibly past the buffer
    let Some((&len, body)) = data.split_first() else {
        return;
    };
    let mut buf = body.to_vec();
    let declared = usize::from(len).min(buf.len() + 8);

    if let Ok(n) = commander.decode_in_place(&mut buf, declared) {
        assert!(n <= declared);
    }
    let _ = commander.decode(body);
});
