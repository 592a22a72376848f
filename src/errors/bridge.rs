// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors crossing the synchronous/asynchronous execution bridge.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The blocking call exceeded its deadline. The scheduled work may
    /// still be running; only the wait is bounded.
    #[error("blocking call timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    /// A blocking call was issued from the event loop's own thread (or
    /// from inside another async context). Waiting here would stall the
    /// loop that has to produce the result.
    #[error("blocking call issued from inside an event loop; use the async API instead")]
    WouldDeadlock,

    /// The event loop thread has shut down and can no longer run work.
    #[error("event loop has shut down")]
    LoopClosed,

    /// The background loop thread could not be started.
    #[error("failed to start event loop: {reason}")]
    Spawn { reason: String },
}
