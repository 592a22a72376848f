// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors for the distributed message bus.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// The broker stayed unreachable after the configured retry budget
    /// was exhausted. Transient failures inside the budget are retried
    /// with exponential backoff and never surface here.
    #[error("broker unavailable after {attempts} attempts: {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    /// A single broker operation failed. Retryable; wrapped into
    /// `BrokerUnavailable` once the retry budget runs out.
    #[error("broker error: {0}")]
    Broker(String),

    /// A payload could not be encoded to or decoded from the wire form.
    #[error("cannot encode or decode bus payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The consumer side of a subscription has gone away.
    #[error("consumer channel closed")]
    ChannelClosed,
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Broker(err.to_string())
    }
}
