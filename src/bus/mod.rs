// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Cross-process message bus with consumer groups and at-least-once
//! delivery.
//!
//! Two implementations sit behind [`MessageBus`]: a redis-streams
//! client for distributed pipelines and an in-process broker with the
//! same delivery semantics for single-process runs and tests. Consumers
//! receive [`BusMessage`]s over an mpsc channel and acknowledge each
//! one; unacknowledged deliveries become claimable by other members of
//! the group after the claim timeout.

mod local;
mod redis;

pub use local::LocalBroker;
pub use redis::RedisBus;

use crate::errors::{BusError, StreamError};
use crate::observability::messages::{BrokerRetry, StructuredLog};
use crate::Value;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// One delivery handed to a consumer.
pub struct BusMessage {
    pub topic: String,
    /// Broker-assigned entry id; ordered within a topic.
    pub id: String,
    pub payload: Value,
    ack_tx: Option<mpsc::Sender<()>>,
}

impl BusMessage {
    pub(crate) fn new(topic: String, id: String, payload: Value) -> Self {
        BusMessage {
            topic,
            id,
            payload,
            ack_tx: None,
        }
    }

    pub(crate) fn with_ack(mut self, ack_tx: mpsc::Sender<()>) -> Self {
        self.ack_tx = Some(ack_tx);
        self
    }

    /// Confirms this delivery. Without the call the entry stays pending
    /// and is eventually redelivered to the group; acking twice is
    /// harmless.
    pub async fn ack(&self) {
        if let Some(tx) = &self.ack_tx {
            let _ = tx.send(()).await;
        }
    }
}

impl std::fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMessage")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Identity and tuning for a grouped subscription.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub topic: String,
    pub group: String,
    pub consumer: String,
    /// Pending deliveries older than this are claimable by peers.
    pub claim_timeout: Duration,
    /// How long one blocking read waits for new entries.
    pub poll_timeout: Duration,
}

/// Message bus seam between the runtime and a broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends a payload to a topic and returns the assigned entry id.
    /// Retries transient broker failures with exponential backoff
    /// before failing with `BrokerUnavailable`.
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, StreamError>;

    /// Fan-out subscription: every subscriber sees every entry appended
    /// after it joined. No delivery state is kept; messages need no ack.
    async fn subscribe(
        &self,
        topic: &str,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), StreamError>;

    /// Grouped subscription: entries are divided among the group's
    /// consumers, each delivery at least once, redelivered on missing
    /// ack after the claim timeout.
    async fn subscribe_group(
        &self,
        options: GroupOptions,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), StreamError>;
}

/// Runs a broker operation with bounded exponential backoff.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    attempts: u32,
    initial_backoff: Duration,
    mut f: F,
) -> Result<T, BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let attempts = attempts.max(1);
    let mut backoff = initial_backoff;
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_reason = err.to_string();
                if attempt < attempts {
                    BrokerRetry {
                        operation,
                        attempt,
                        backoff_ms: backoff.as_millis() as u64,
                        reason: &last_reason,
                    }
                    .log();
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(BusError::BrokerUnavailable {
        attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_once_the_operation_does() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("publish", 5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BusError::Broker("connection refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_the_attempt_count() {
        let result: Result<(), BusError> =
            retry_with_backoff("publish", 3, Duration::from_millis(1), || async {
                Err(BusError::Broker("down".into()))
            })
            .await;
        match result {
            Err(BusError::BrokerUnavailable { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("down"));
            }
            other => panic!("expected BrokerUnavailable, got {other:?}"),
        }
    }
}
