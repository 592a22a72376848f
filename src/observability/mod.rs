// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! Message types for recurring operational events live in `messages` and
//! follow a struct-based pattern with `Display` implementations, keeping
//! magic strings out of the subsystems that emit them.

pub mod messages;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// `filter` takes a tracing directive such as `"freshet=debug"`; when
/// absent the `RUST_LOG` environment variable applies, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
