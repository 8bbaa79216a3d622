// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `#[test]` replacement that routes `tracing` output to the test harness.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset or unparsable.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::DEBUG;

#[doc(hidden)]
/// Installs the global subscriber once per test binary.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(DEFAULT_LEVEL));

        tracing_subscriber::fmt()
            .compact()
            .with_ansi(false)
            .with_target(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}
