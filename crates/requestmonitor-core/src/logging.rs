// SPDX-License-Identifier: Apache-2.0

//! Opt-in logging initializer. This crate is a library embedded in a host
//! process, so it never installs a global subscriber on its own — callers
//! that want one (a standalone binary, `demos/`, an integration test) call
//! [`init`] explicitly.

use tracing_subscriber::{EnvFilter, fmt};

/// Installs a `tracing_subscriber::fmt` subscriber filtered by `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once; later
/// calls are no-ops (`set_global_default` failing is swallowed, since a
/// second initializer racing the first is not a reportable error).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
