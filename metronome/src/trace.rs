/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Tracing subscriber bootstrap for embedders and tests.
//!
//! The library itself only *emits* `tracing` events; installing a subscriber
//! is the embedder's choice. This helper wires up the common case: compact
//! fmt output filtered by `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

/// Install the default subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init();
        super::init();
    }
}
