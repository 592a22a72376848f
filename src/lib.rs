// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod bridge;     // sync/async execution bridge
pub mod bus;        // distributed message bus
pub mod cache;      // bounded per-stream history
pub mod config;     // runtime configuration
pub mod errors;     // error handling
pub mod graph;      // stream graph + operators
pub mod observability;
pub mod runtime;    // named registry, topics, tables
pub mod scheduler;  // timers and cron jobs
pub mod sources;    // external feeds (file tails)
pub mod store;      // persistent key/value + time-log store

mod utils;

/// Payload type flowing through the graph: structured JSON values.
pub type Value = serde_json::Value;

pub use errors::StreamError;
pub use graph::Stream;
pub use runtime::Runtime;
