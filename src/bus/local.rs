// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::{BusMessage, GroupOptions, MessageBus};
use crate::errors::StreamError;
use crate::observability::messages::{DeliveryClaimed, StructuredLog};
use crate::utils::locked;
use crate::Value;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READ_BATCH: usize = 32;

struct PendingDelivery {
    consumer: String,
    deadline: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Highest entry id handed out as a fresh delivery.
    last_delivered: u64,
    pending: HashMap<u64, PendingDelivery>,
}

#[derive(Default)]
struct TopicLog {
    next_id: u64,
    entries: VecDeque<(u64, Value)>,
    groups: HashMap<String, GroupState>,
}

/// In-process broker with the same topic/group/ack semantics as the
/// redis client, used when no broker URL is configured.
///
/// Unlike a broker created at the stream tail, local groups read the
/// whole retained log from the start, which keeps single-process replay
/// and test scenarios deterministic.
#[derive(Clone)]
pub struct LocalBroker {
    topics: Arc<Mutex<HashMap<String, TopicLog>>>,
    max_len: usize,
}

impl LocalBroker {
    pub fn new(max_len: usize) -> Self {
        LocalBroker {
            topics: Arc::new(Mutex::new(HashMap::new())),
            max_len: max_len.max(1),
        }
    }

    /// Appends an entry, trimming the oldest past `max_len`.
    pub fn append(&self, topic: &str, payload: Value) -> u64 {
        let mut topics = locked(&self.topics);
        let log = topics.entry(topic.to_string()).or_default();
        log.next_id += 1;
        let id = log.next_id;
        log.entries.push_back((id, payload));
        while log.entries.len() > self.max_len {
            log.entries.pop_front();
        }
        id
    }

    /// One grouped read: expired pending deliveries first (claimed for
    /// `consumer`), then fresh entries past the group's cursor, at most
    /// `count` in total. Every returned entry is pending until acked.
    pub fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        claim_timeout: Duration,
        count: usize,
    ) -> Vec<(u64, Value)> {
        let now = Instant::now();
        let mut topics = locked(&self.topics);
        let Some(log) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let state = log.groups.entry(group.to_string()).or_default();

        let mut expired: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, delivery)| delivery.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired.truncate(count);

        let mut out = Vec::new();
        for id in expired {
            let Some(payload) = lookup(&log.entries, id) else {
                // Trimmed out of retention; nothing left to redeliver.
                state.pending.remove(&id);
                continue;
            };
            state.pending.insert(
                id,
                PendingDelivery {
                    consumer: consumer.to_string(),
                    deadline: now + claim_timeout,
                },
            );
            out.push((id, payload));
        }
        if !out.is_empty() {
            DeliveryClaimed {
                topic,
                group,
                consumer,
                claimed: out.len(),
            }
            .log();
        }

        for (id, payload) in log.entries.iter() {
            if out.len() >= count {
                break;
            }
            if *id <= state.last_delivered {
                continue;
            }
            state.last_delivered = *id;
            state.pending.insert(
                *id,
                PendingDelivery {
                    consumer: consumer.to_string(),
                    deadline: now + claim_timeout,
                },
            );
            out.push((*id, payload.clone()));
        }
        out
    }

    /// Confirms a delivery; the entry will never be redelivered to the
    /// group.
    pub fn ack(&self, topic: &str, group: &str, id: u64) {
        let mut topics = locked(&self.topics);
        if let Some(log) = topics.get_mut(topic) {
            if let Some(state) = log.groups.get_mut(group) {
                state.pending.remove(&id);
            }
        }
    }

    /// Entries appended after `cursor`, for ungrouped fan-out readers.
    pub fn read_after(&self, topic: &str, cursor: u64, count: usize) -> Vec<(u64, Value)> {
        let topics = locked(&self.topics);
        let Some(log) = topics.get(topic) else {
            return Vec::new();
        };
        log.entries
            .iter()
            .filter(|(id, _)| *id > cursor)
            .take(count)
            .cloned()
            .collect()
    }

    /// Current tail id of a topic (0 when empty or unknown).
    pub fn tail(&self, topic: &str) -> u64 {
        locked(&self.topics)
            .get(topic)
            .map(|log| log.next_id)
            .unwrap_or(0)
    }

    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        locked(&self.topics)
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    /// Which consumer currently holds a pending delivery.
    pub fn pending_holder(&self, topic: &str, group: &str, id: u64) -> Option<String> {
        locked(&self.topics)
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .and_then(|state| state.pending.get(&id))
            .map(|delivery| delivery.consumer.clone())
    }
}

fn lookup(entries: &VecDeque<(u64, Value)>, id: u64) -> Option<Value> {
    entries
        .iter()
        .find(|(entry_id, _)| *entry_id == id)
        .map(|(_, payload)| payload.clone())
}

#[async_trait]
impl MessageBus for LocalBroker {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<String, StreamError> {
        Ok(self.append(topic, payload.clone()).to_string())
    }

    async fn subscribe(
        &self,
        topic: &str,
        sender: mpsc::Sender<BusMessage>,
    ) -> Result<(), StreamError> {
        let broker = self.clone();
        let topic = topic.to_string();
        let mut cursor = broker.tail(&topic);
        tokio::spawn(async move {
            loop {
                let batch = broker.read_after(&topic, cursor, READ_BATCH);
                if batch.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    if sender.is_closed() {
                        break;
                    }
                    continue;
                }
                for (id, payload) in batch {
                    cursor = cursor.max(id);
                    let message = BusMessage::new(topic.clone(), id.to_string(), payload);
                    if sender.send(message).await.is_err() {
                        return;
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
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                let batch = broker.read_group(
                    &options.topic,
                    &options.group,
                    &options.consumer,
                    options.claim_timeout,
                    READ_BATCH,
                );
                if batch.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    if sender.is_closed() {
                        break;
                    }
                    continue;
                }
                for (id, payload) in batch {
                    let (ack_tx, mut ack_rx) = mpsc::channel(1);
                    let message = BusMessage::new(options.topic.clone(), id.to_string(), payload)
                        .with_ack(ack_tx);

                    let acker = broker.clone();
                    let topic = options.topic.clone();
                    let group = options.group.clone();
                    tokio::spawn(async move {
                        if ack_rx.recv().await.is_some() {
                            acker.ack(&topic, &group, id);
                        }
                    });

                    if sender.send(message).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }
}
