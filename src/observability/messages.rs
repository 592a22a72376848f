// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for recurring operational log events.
//!
//! Organized by subsystem:
//! * bus - broker connectivity and redelivery events
//! * scheduler - job lifecycle events
//! * store - capacity eviction events

use std::fmt::{Display, Formatter};

/// Common interface for emitting a message at its intended level.
pub trait StructuredLog: Display {
    fn log(&self);
}

/// A broker operation failed and will be retried.
///
/// # Log Level
/// `warn!` - transient, handled by the retry loop
pub struct BrokerRetry<'a> {
    pub operation: &'a str,
    pub attempt: u32,
    pub backoff_ms: u64,
    pub reason: &'a str,
}

impl Display for BrokerRetry<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Broker {} failed (attempt {}), retrying in {}ms: {}",
            self.operation, self.attempt, self.backoff_ms, self.reason
        )
    }
}

impl StructuredLog for BrokerRetry<'_> {
    fn log(&self) {
        tracing::warn!(
            operation = self.operation,
            attempt = self.attempt,
            backoff_ms = self.backoff_ms,
            "{}", self
        );
    }
}

/// A stale pending delivery was claimed for redelivery.
///
/// # Log Level
/// `info!` - expected under at-least-once delivery
pub struct DeliveryClaimed<'a> {
    pub topic: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub claimed: usize,
}

impl Display for DeliveryClaimed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Claimed {} stale deliveries on '{}' for group '{}' consumer '{}'",
            self.claimed, self.topic, self.group, self.consumer
        )
    }
}

impl StructuredLog for DeliveryClaimed<'_> {
    fn log(&self) {
        tracing::info!(
            topic = self.topic,
            group = self.group,
            consumer = self.consumer,
            claimed = self.claimed,
            "{}", self
        );
    }
}

/// A scheduled job's handler returned an error.
///
/// # Log Level
/// `error!` - the job stays scheduled and will run again
pub struct JobFailed<'a> {
    pub job: &'a str,
    pub error: &'a dyn std::error::Error,
}

impl Display for JobFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Scheduled job '{}' failed: {}", self.job, self.error)
    }
}

impl StructuredLog for JobFailed<'_> {
    fn log(&self) {
        tracing::error!(job = self.job, error = %self.error, "{}", self);
    }
}

/// A full namespace evicted its oldest record to admit a new one.
///
/// # Log Level
/// `debug!` - routine bookkeeping under a max_size bound
pub struct OldestEvicted<'a> {
    pub namespace: &'a str,
    pub evicted_key: &'a str,
}

impl Display for OldestEvicted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Namespace '{}' at capacity; evicted oldest record '{}'",
            self.namespace, self.evicted_key
        )
    }
}

impl StructuredLog for OldestEvicted<'_> {
    fn log(&self) {
        tracing::debug!(
            namespace = self.namespace,
            evicted_key = self.evicted_key,
            "{}", self
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_retry_renders_attempt_and_backoff() {
        let msg = BrokerRetry {
            operation: "publish",
            attempt: 2,
            backoff_ms: 200,
            reason: "connection refused",
        };
        let rendered = msg.to_string();
        assert!(rendered.contains("publish"));
        assert!(rendered.contains("attempt 2"));
        assert!(rendered.contains("200ms"));
    }

    #[test]
    fn eviction_names_the_namespace() {
        let msg = OldestEvicted {
            namespace: "ticks",
            evicted_key: "00000000000000000001",
        };
        assert!(msg.to_string().contains("'ticks'"));
    }
}
