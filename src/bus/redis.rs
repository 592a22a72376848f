// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::{retry_with_backoff, BusMessage, GroupOptions, MessageBus};
use crate::config::BusConfig;
use crate::errors::{BusError, StreamError};
use crate::observability::messages::{DeliveryClaimed, StructuredLog};
use crate::Value;
use async_trait::async_trait;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;

const READ_BATCH: usize = 32;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Redis-streams bus: topics are streams capped with `MAXLEN ~`, groups
/// are consumer groups, redelivery of unacked entries goes through
/// `XAUTOCLAIM`.
///
/// Listener tasks never give up on broker errors; they log, back off,
/// and reconnect, so a broker outage degrades the bus without touching
/// the rest of the graph.
pub struct RedisBus {
    client: redis::Client,
    max_len: usize,
    publish_attempts: u32,
    publish_backoff: Duration,
    poll_timeout: Duration,
}

impl RedisBus {
    pub fn connect(config: &BusConfig) -> Result<Self, StreamError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| BusError::Broker("no broker url configured".into()))?;
        let client = redis::Client::open(url).map_err(BusError::from)?;
        Ok(RedisBus {
            client,
            max_len: config.max_len,
            publish_attempts: config.publish_attempts,
            publish_backoff: Duration::from_millis(config.publish_backoff_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        })
    }
}

fn decode_payload(entry: &StreamId) -> Option<Value> {
    let raw = entry.map.get("payload")?;
    let body: String = match redis::from_redis_value(raw) {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(id = %entry.id, error = %err, "undecodable stream entry skipped");
            return None;
        }
    };
    match serde_json::from_str(&body) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::warn!(id = %entry.id, error = %err, "non-json stream entry skipped");
            None
        }
    }
}

/// Hands one entry to the subscriber with an ack handle wired to XACK.
/// Returns false when the subscriber is gone.
async fn deliver(
    client: &redis::Client,
    sender: &mpsc::Sender<BusMessage>,
    topic: &str,
    group: &str,
    entry: &StreamId,
) -> bool {
    let Some(payload) = decode_payload(entry) else {
        return true;
    };
    let (ack_tx, mut ack_rx) = mpsc::channel(1);
    let message =
        BusMessage::new(topic.to_string(), entry.id.clone(), payload).with_ack(ack_tx);

    let ack_client = client.clone();
    let ack_topic = topic.to_string();
    let ack_group = group.to_string();
    let ack_id = entry.id.clone();
    tokio::spawn(async move {
        if ack_rx.recv().await.is_some() {
            match ack_client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let result: redis::RedisResult<i64> =
                        conn.xack(&ack_topic, &ack_group, &[&ack_id]).await;
                    if let Err(err) = result {
                        tracing::warn!(id = %ack_id, error = %err, "ack failed; entry will be redelivered");
                    }
                }
                Err(err) => {
                    tracing::warn!(id = %ack_id, error = %err, "ack failed; entry will be redelivered");
                }
            }
        }
    });

    sender.send(message).await.is_ok()
}

async fn ensure_group(
    conn: &mut redis::aio::MultiplexedConnection,
    topic: &str,
    group: &str,
) {
    let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "$").await;
    if let Err(err) = result {
        if err.code() != Some("BUSYGROUP") {
            tracing::warn!(topic, group, error = %err, "consumer group creation failed");
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, StreamError> {
        let body = serde_json::to_string(payload).map_err(BusError::from)?;
        let id = retry_with_backoff(
            "publish",
            self.publish_attempts,
            self.publish_backoff,
            || {
                let client = self.client.clone();
                let topic = topic.to_string();
                let body = body.clone();
                let max_len = self.max_len;
                async move {
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    let id: String = redis::cmd("XADD")
                        .arg(&topic)
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(max_len)
                        .arg("*")
                        .arg("payload")
                        .arg(&body)
                        .query_async(&mut conn)
                        .await?;
                    Ok(id)
                }
            },
        )
        .await?;
        Ok(id)
    }

    async fn subscribe(
        &self,
        topic: &str,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), StreamError> {
        let client = self.client.clone();
        let topic = topic.to_string();
        let block_ms = self.poll_timeout.as_millis() as usize;

        tokio::spawn(async move {
            let mut last_id = "$".to_string();
            'reconnect: loop {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(topic, error = %err, "broker unreachable; retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                };
                loop {
                    let opts = StreamReadOptions::default().block(block_ms).count(READ_BATCH);
                    let result: redis::RedisResult<StreamReadReply> =
                        conn.xread_options(&[&topic], &[&last_id], &opts).await;
                    match result {
                        Ok(reply) => {
                            for key in reply.keys {
                                for entry in key.ids {
                                    last_id = entry.id.clone();
                                    let Some(payload) = decode_payload(&entry) else {
                                        continue;
                                    };
                                    let message = BusMessage::new(
                                        topic.clone(),
                                        entry.id.clone(),
                                        payload,
                                    );
                                    if sender.send(message).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            if sender.is_closed() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(topic, error = %err, "stream read failed; reconnecting");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                            continue 'reconnect;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn subscribe_group(
        &self,
        options: GroupOptions,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), StreamError> {
        let client = self.client.clone();
        let block_ms = options.poll_timeout.as_millis() as usize;
        let claim_ms = options.claim_timeout.as_millis() as u64;

        tokio::spawn(async move {
            'reconnect: loop {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(topic = %options.topic, error = %err, "broker unreachable; retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                        continue;
                    }
                };
                ensure_group(&mut conn, &options.topic, &options.group).await;

                loop {
                    // Stale pending entries from crashed peers first.
                    let claim: redis::RedisResult<StreamAutoClaimReply> = redis::cmd("XAUTOCLAIM")
                        .arg(&options.topic)
                        .arg(&options.group)
                        .arg(&options.consumer)
                        .arg(claim_ms)
                        .arg("0-0")
                        .arg("COUNT")
                        .arg(READ_BATCH)
                        .query_async(&mut conn)
                        .await;
                    match claim {
                        Ok(reply) => {
                            if !reply.claimed.is_empty() {
                                DeliveryClaimed {
                                    topic: &options.topic,
                                    group: &options.group,
                                    consumer: &options.consumer,
                                    claimed: reply.claimed.len(),
                                }
                                .log();
                            }
                            for entry in &reply.claimed {
                                if !deliver(&client, &sender, &options.topic, &options.group, entry)
                                    .await
                                {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::warn!(topic = %options.topic, error = %err, "autoclaim failed; reconnecting");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                            continue 'reconnect;
                        }
                    }

                    let opts = StreamReadOptions::default()
                        .group(&options.group, &options.consumer)
                        .block(block_ms)
                        .count(READ_BATCH);
                    let result: redis::RedisResult<StreamReadReply> =
                        conn.xread_options(&[&options.topic], &[">"], &opts).await;
                    match result {
                        Ok(reply) => {
                            for key in reply.keys {
                                for entry in key.ids {
                                    if !deliver(
                                        &client,
                                        &sender,
                                        &options.topic,
                                        &options.group,
                                        &entry,
                                    )
                                    .await
                                    {
                                        return;
                                    }
                                }
                            }
                            if sender.is_closed() {
                                return;
                            }
                        }
                        Err(err) => {
                            if err.code() == Some("NOGROUP") {
                                ensure_group(&mut conn, &options.topic, &options.group).await;
                                continue;
                            }
                            tracing::warn!(topic = %options.topic, error = %err, "grouped read failed; reconnecting");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                            continue 'reconnect;
                        }
                    }
                }
            }
        });
        Ok(())
    }
}
