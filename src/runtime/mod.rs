// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The runtime: one event loop, one bus, one scheduler, and a registry
//! of named streams, topics, and tables.
//!
//! Lookups are create-or-attach: independently loaded code asking for
//! the same name gets a handle to the same running object, which is how
//! UI panels and side modules join a pipeline they did not build.

use crate::bridge::ExecLoop;
use crate::bus::{GroupOptions, LocalBroker, MessageBus, RedisBus};
use crate::config::consts::DEFAULT_BLOCK_TIMEOUT_MS;
use crate::config::RuntimeConfig;
use crate::errors::{StreamError, ValidationError};
use crate::graph::{Stream, WeakStream};
use crate::scheduler::Scheduler;
use crate::store::{KeyMode, MappingPolicy, Store, WriteOp};
use crate::utils::locked;
use crate::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

struct RuntimeInner {
    config: RuntimeConfig,
    exec: ExecLoop,
    bus: Arc<dyn MessageBus>,
    scheduler: Scheduler,
    block_timeout: Duration,
    streams: Mutex<HashMap<String, Stream>>,
    topics: Mutex<HashMap<String, Topic>>,
    tables: Mutex<HashMap<String, Table>>,
    /// Weak handles to every node the runtime knows about, for
    /// introspection and visualization. Never used for delivery.
    nodes: Mutex<Vec<WeakStream>>,
}

/// Owner of the pipeline context. Cheap to clone; all clones share the
/// same loop, bus, scheduler, and registries.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Starts a runtime: a background event loop, the configured bus
    /// (redis when a URL is set, the in-process broker otherwise), and
    /// the job scheduler.
    pub fn new(config: RuntimeConfig) -> Result<Runtime, StreamError> {
        let exec = ExecLoop::background()?;
        let bus: Arc<dyn MessageBus> = if config.bus.url.is_some() {
            Arc::new(RedisBus::connect(&config.bus)?)
        } else {
            Arc::new(LocalBroker::new(config.bus.max_len))
        };
        let scheduler = Scheduler::start(&exec);
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                exec,
                bus,
                scheduler,
                block_timeout: Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MS),
                streams: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                tables: Mutex::new(HashMap::new()),
                nodes: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Fully local runtime with defaults; handy for tests and demos.
    pub fn local() -> Result<Runtime, StreamError> {
        Runtime::new(RuntimeConfig::default())
    }

    pub fn exec_loop(&self) -> &ExecLoop {
        &self.inner.exec
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.inner.bus.clone()
    }

    /// Adds a node to the introspection registry. Registration never
    /// keeps a node alive; dead entries are pruned on the next listing.
    pub fn register(&self, stream: &Stream) {
        locked(&self.inner.nodes).push(stream.downgrade());
    }

    /// The live registered nodes, pruning entries whose nodes are gone.
    pub fn nodes(&self) -> Vec<Stream> {
        let mut nodes = locked(&self.inner.nodes);
        let mut live = Vec::with_capacity(nodes.len());
        nodes.retain(|weak| match weak.upgrade() {
            Some(stream) => {
                live.push(stream);
                true
            }
            None => false,
        });
        live
    }

    /// The named stream, created on first lookup and bound to the
    /// runtime's event loop.
    pub fn stream(&self, name: &str) -> Stream {
        let stream = locked(&self.inner.streams)
            .entry(name.to_string())
            .or_insert_with(|| {
                Stream::builder()
                    .name(name)
                    .with_loop(self.inner.exec.clone())
                    .build()
            })
            .clone();
        self.maybe_register(&stream);
        stream
    }

    fn maybe_register(&self, stream: &Stream) {
        let mut nodes = locked(&self.inner.nodes);
        let known = nodes
            .iter()
            .any(|weak| weak.upgrade().map(|other| other.id()) == Some(stream.id()));
        if !known {
            nodes.push(stream.downgrade());
        }
    }

    /// The named topic: a stream backed by a bus topic of the same name.
    pub fn topic(&self, name: &str) -> Result<Topic, StreamError> {
        validate_component_name(name)?;
        let mut topics = locked(&self.inner.topics);
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Topic {
            inner: Arc::new(TopicInner {
                name: name.to_string(),
                stream: Stream::builder()
                    .name(name)
                    .with_loop(self.inner.exec.clone())
                    .build(),
                bus: self.inner.bus.clone(),
                exec: self.inner.exec.clone(),
                claim_timeout: Duration::from_millis(self.inner.config.bus.claim_timeout_ms),
                poll_timeout: Duration::from_millis(self.inner.config.bus.poll_timeout_ms),
                block_timeout: self.inner.block_timeout,
                pumping: AtomicBool::new(false),
            }),
        };
        topics.insert(name.to_string(), topic.clone());
        self.maybe_register(&topic.inner.stream);
        Ok(topic)
    }

    /// The named table with time keys and the default mapping policy.
    pub fn table(&self, name: &str) -> Result<Table, StreamError> {
        self.table_with(name, KeyMode::Time, MappingPolicy::default())
    }

    /// The named table with explicit key mode and policy. Lookups after
    /// the first return the existing table regardless of the arguments.
    pub fn table_with(
        &self,
        name: &str,
        mode: KeyMode,
        policy: MappingPolicy,
    ) -> Result<Table, StreamError> {
        {
            let tables = locked(&self.inner.tables);
            if let Some(table) = tables.get(name) {
                return Ok(table.clone());
            }
        }

        // Opening the store is async; cross the bridge outside the
        // registry lock.
        let storage = self.inner.config.storage.clone();
        let namespace = name.to_string();
        let store = self.inner.exec.block_on(
            async move { Store::open(&storage, &namespace, mode, policy).await },
            Some(self.inner.block_timeout),
        )?;

        let mut tables = locked(&self.inner.tables);
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }
        let table = Table {
            inner: Arc::new(TableInner {
                stream: Stream::builder()
                    .name(name)
                    .with_loop(self.inner.exec.clone())
                    .build(),
                store: Arc::new(store),
                exec: self.inner.exec.clone(),
                block_timeout: self.inner.block_timeout,
            }),
        };
        tables.insert(name.to_string(), table.clone());
        self.maybe_register(&table.inner.stream);
        Ok(table)
    }
}

fn validate_component_name(name: &str) -> Result<(), StreamError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidName { name: name.into() }.into())
    }
}

struct TopicInner {
    name: String,
    stream: Stream,
    bus: Arc<dyn MessageBus>,
    exec: ExecLoop,
    claim_timeout: Duration,
    poll_timeout: Duration,
    block_timeout: Duration,
    pumping: AtomicBool,
}

/// A stream whose values travel through a bus topic, so producers and
/// consumers can live in different processes.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The local stream side of the topic; attach operators here.
    pub fn stream(&self) -> Stream {
        self.inner.stream.clone()
    }

    /// Appends a value to the bus topic, blocking the caller. Publish
    /// retries happen inside the bus client.
    pub fn publish(&self, value: Value) -> Result<String, StreamError> {
        let bus = self.inner.bus.clone();
        let name = self.inner.name.clone();
        self.inner.exec.block_on(
            async move { bus.publish(&name, &value).await },
            Some(self.inner.block_timeout),
        )
    }

    /// Starts draining the bus topic into the local stream as a member
    /// of this process's consumer group. Deliveries are acked only
    /// after the graph accepts them, so a crash mid-emission leaves the
    /// entry claimable. Calling this twice is a no-op.
    pub fn pump(&self) {
        if self.inner.pumping.swap(true, Ordering::SeqCst) {
            return;
        }
        let options = GroupOptions {
            topic: self.inner.name.clone(),
            group: format!("{}-{}", self.inner.name, std::process::id()),
            consumer: format!(
                "{}-{}",
                std::process::id(),
                NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed)
            ),
            claim_timeout: self.inner.claim_timeout,
            poll_timeout: self.inner.poll_timeout,
        };
        let bus = self.inner.bus.clone();
        let stream = self.inner.stream.clone();
        let (tx, mut rx) = mpsc::channel(64);

        self.inner.exec.spawn(async move {
            if let Err(err) = bus.subscribe_group(options, tx).await {
                tracing::error!(error = %err, "topic subscription failed");
                return;
            }
            while let Some(message) = rx.recv().await {
                match stream.emit(message.payload.clone()) {
                    Ok(_) => message.ack().await,
                    Err(err) => {
                        tracing::error!(
                            topic = %message.topic,
                            id = %message.id,
                            error = %err,
                            "emission failed; delivery left pending for redelivery"
                        );
                    }
                }
            }
        });
    }
}

struct TableInner {
    stream: Stream,
    store: Arc<Store>,
    exec: ExecLoop,
    block_timeout: Duration,
}

/// A stream with a persistent shadow: every emitted value is written to
/// the table's store namespace before it flows into the graph.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

/// How a value lands in the store, mirroring its shape: objects are
/// bulk mappings, two-element `[key, value]` arrays with a string key
/// are upserts, everything else appends under a fresh time key.
pub(crate) fn classify(value: &Value) -> WriteOp {
    if let Value::Object(mapping) = value {
        return WriteOp::BulkUpdate {
            mapping: mapping.clone(),
        };
    }
    if let Value::Array(items) = value {
        if items.len() == 2 {
            if let Some(key) = items[0].as_str() {
                return WriteOp::Upsert {
                    key: key.to_string(),
                    value: items[1].clone(),
                };
            }
        }
    }
    WriteOp::Append {
        value: value.clone(),
    }
}

impl Table {
    pub fn stream(&self) -> Stream {
        self.inner.stream.clone()
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Persists a value, then emits it into the table's stream. A
    /// rejected write (for example a raw mapping on a time-keyed table)
    /// propagates and nothing is emitted.
    pub fn emit(&self, value: Value) -> Result<Vec<Value>, StreamError> {
        let op = classify(&value);
        let store = self.inner.store.clone();
        self.inner.exec.block_on(
            async move { store.write(op).await },
            Some(self.inner.block_timeout),
        )?;
        self.inner.stream.emit(value)
    }

    /// Blocking point read.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StreamError> {
        let store = self.inner.store.clone();
        let key = key.to_string();
        self.inner.exec.block_on(
            async move { store.get(&key).await },
            Some(self.inner.block_timeout),
        )
    }

    /// Blocking range read over `[start, end)`.
    pub fn range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<(String, Value)>, StreamError> {
        let store = self.inner.store.clone();
        let start = start.map(str::to_string);
        let end = end.map(str::to_string);
        self.inner.exec.block_on(
            async move { store.range(start.as_deref(), end.as_deref()).await },
            Some(self.inner.block_timeout),
        )
    }

    /// Replays `[start, end)` into the table's stream on the event
    /// loop, pacing records by `interval` when given.
    pub fn replay_into(
        &self,
        start: Option<String>,
        end: Option<String>,
        interval: Option<Duration>,
    ) {
        let store = self.inner.store.clone();
        let stream = self.inner.stream.clone();
        self.inner.exec.spawn(async move {
            let mut replay = match store.replay(start.as_deref(), end.as_deref(), interval).await {
                Ok(replay) => replay,
                Err(err) => {
                    tracing::error!(error = %err, "replay setup failed");
                    return;
                }
            };
            loop {
                match replay.next().await {
                    Ok(Some((_key, value))) => {
                        if let Err(err) = stream.emit(value) {
                            tracing::error!(error = %err, "replayed value rejected by graph");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(error = %err, "replay aborted");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn named_streams_are_singletons() {
        let runtime = Runtime::local().unwrap();
        let a = runtime.stream("prices");
        let b = runtime.stream("prices");
        let seen = b.to_list();
        a.emit(json!(1)).unwrap();
        assert_eq!(seen.snapshot(), vec![json!(1)]);
        assert!(a.exec_loop().is_some());
    }

    #[test]
    fn registry_tracks_nodes_without_owning_them() {
        let runtime = Runtime::local().unwrap();
        runtime.stream("prices");
        runtime.stream("prices");
        assert_eq!(runtime.nodes().len(), 1);

        let side = Stream::new();
        runtime.register(&side);
        assert_eq!(runtime.nodes().len(), 2);

        // Dropping the last strong handle prunes the entry.
        drop(side);
        let names: Vec<Option<String>> = runtime
            .nodes()
            .iter()
            .map(|stream| stream.name().map(str::to_string))
            .collect();
        assert_eq!(names, vec![Some("prices".to_string())]);
    }

    #[test]
    fn topic_names_are_validated() {
        let runtime = Runtime::local().unwrap();
        assert!(matches!(
            runtime.topic("not a name"),
            Err(StreamError::Validation(ValidationError::InvalidName { .. }))
        ));
    }

    #[test]
    fn topic_round_trips_through_the_local_broker() {
        let runtime = Runtime::local().unwrap();
        let topic = runtime.topic("ticks").unwrap();
        let seen = topic.stream().to_list();

        topic.pump();
        topic.publish(json!({"price": 10})).unwrap();
        topic.publish(json!({"price": 11})).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            seen.snapshot(),
            vec![json!({"price": 10}), json!({"price": 11})]
        );
    }

    #[test]
    fn values_are_classified_by_shape() {
        assert!(matches!(
            classify(&json!({"a": 1})),
            WriteOp::BulkUpdate { .. }
        ));
        assert!(matches!(
            classify(&json!(["theme", "dark"])),
            WriteOp::Upsert { key, .. } if key == "theme"
        ));
        assert!(matches!(classify(&json!(42)), WriteOp::Append { .. }));
        // A two-element array without a string key is plain data.
        assert!(matches!(classify(&json!([1, 2])), WriteOp::Append { .. }));
    }

    #[test]
    fn table_persists_scalars_and_rejects_raw_mappings() {
        let runtime = Runtime::local().unwrap();
        let table = runtime.table("events").unwrap();
        let seen = table.stream().to_list();

        table.emit(json!(1)).unwrap();
        table.emit(json!(2)).unwrap();
        assert_eq!(seen.snapshot(), vec![json!(1), json!(2)]);
        assert_eq!(table.range(None, None).unwrap().len(), 2);

        // Time-keyed table under the default policy: mappings bounce
        // and nothing reaches the stream.
        assert!(table.emit(json!({"a": 1})).is_err());
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn explicit_table_accepts_key_value_pairs() {
        let runtime = Runtime::local().unwrap();
        let table = runtime
            .table_with("prefs", KeyMode::Explicit, MappingPolicy::default())
            .unwrap();

        table.emit(json!(["theme", "dark"])).unwrap();
        assert_eq!(table.get("theme").unwrap(), Some(json!("dark")));

        table.emit(json!({"lang": "en", "tz": "UTC"})).unwrap();
        assert_eq!(table.get("lang").unwrap(), Some(json!("en")));
    }

    #[test]
    fn table_lookup_returns_the_same_instance() {
        let runtime = Runtime::local().unwrap();
        let a = runtime.table("events").unwrap();
        let b = runtime.table("events").unwrap();
        a.emit(json!("x")).unwrap();
        assert_eq!(b.range(None, None).unwrap().len(), 1);
    }

    #[test]
    fn replay_feeds_history_back_into_the_stream() {
        let runtime = Runtime::local().unwrap();
        let table = runtime.table("events").unwrap();
        for i in 0..3 {
            table.emit(json!(i)).unwrap();
        }

        let replayed = table.stream().to_list();
        table.replay_into(None, None, None);

        let deadline = Instant::now() + Duration::from_secs(3);
        while replayed.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(replayed.snapshot(), vec![json!(0), json!(1), json!(2)]);
    }
}
