// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod bridge;
mod bus;
mod graph;
mod store;

pub use bridge::BridgeError;
pub use bus::BusError;
pub use graph::{RoutingError, ValidationError};
pub use store::StoreError;

use thiserror::Error;

/// Top-level error type flowing through the stream graph.
///
/// Operator failures propagate to the emitting caller by default; see
/// `Stream::catch_except` for the explicit opt-in that converts a failure
/// into a structured event instead.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// A user-supplied handler failed while processing a value.
    #[error("handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },
}

impl StreamError {
    /// Convenience constructor for failures inside user handlers.
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        StreamError::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }
}
