// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The stream graph: nodes, operators, and synchronous fan-out.
//!
//! A [`Stream`] is a cheap handle to a graph node. Values pushed in with
//! [`Stream::emit`] flow downstream in insertion order; each node's
//! operator transforms, gates, buffers, or consumes them. Results that
//! reach a non-sink leaf are collected and flattened back to the caller.
//!
//! Edges hold downstreams strongly and upstreams weakly, so dropping
//! every handle to a subgraph tears it down without reference cycles.

mod combine;
mod operators;

#[cfg(test)]
mod integration_tests;

use crate::bridge::ExecLoop;
use crate::cache::{BoundedCache, CacheConfig};
use crate::errors::{RoutingError, StreamError, ValidationError};
use crate::utils::locked;
use crate::Value;
use operators::{
    AccumulateOp, AccumulateWithOp, BufferOp, FilterOp, MapOp, PassOp, RateLimitOp, SinkOp,
    SlidingWindowOp, TimedWindowOp,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// A node operator: receives one value and decides what flows on.
///
/// `who` identifies the upstream node the value arrived from (`None`
/// for direct emits); only combining operators care. Implementations
/// push their outputs through [`forward`] so caching, null-refusal,
/// routes, and fan-out behave uniformly.
pub(crate) trait Operator: Send + Sync {
    fn update(
        &self,
        value: Value,
        who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError>;

    fn name(&self) -> &'static str;
}

struct RouteEntry {
    predicate: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    handler: Box<dyn Fn(Value) -> Result<(), StreamError> + Send + Sync>,
}

pub(crate) struct NodeInner {
    id: u64,
    name: Option<String>,
    op: Box<dyn Operator>,
    /// Null values are dropped at this node unless disabled.
    refuse_none: bool,
    downstreams: Mutex<Vec<Arc<NodeInner>>>,
    upstreams: Mutex<Vec<Weak<NodeInner>>>,
    /// Event loop this node's connected component is bound to.
    affinity: Mutex<Option<ExecLoop>>,
    cache: Mutex<Option<BoundedCache>>,
    routes: Mutex<Vec<RouteEntry>>,
}

impl NodeInner {
    fn create(
        op: Box<dyn Operator>,
        name: Option<String>,
        refuse_none: bool,
        affinity: Option<ExecLoop>,
        cache: Option<CacheConfig>,
    ) -> Arc<NodeInner> {
        Arc::new(NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            op,
            refuse_none,
            downstreams: Mutex::new(Vec::new()),
            upstreams: Mutex::new(Vec::new()),
            affinity: Mutex::new(affinity),
            cache: Mutex::new(cache.map(BoundedCache::new)),
            routes: Mutex::new(Vec::new()),
        })
    }
}

/// Pushes a node's output onward: drop nulls, record history, run the
/// node's routes, then fan out to downstreams in insertion order.
///
/// With no downstreams the value itself is the result, which is how
/// terminal values surface from [`Stream::emit`].
pub(crate) fn forward(node: &Arc<NodeInner>, value: Value) -> Result<Vec<Value>, StreamError> {
    if node.refuse_none && value.is_null() {
        return Ok(Vec::new());
    }

    if let Some(cache) = locked(&node.cache).as_mut() {
        cache.insert(value.clone());
    }

    {
        let routes = locked(&node.routes);
        for route in routes.iter() {
            if (route.predicate)(&value) {
                (route.handler)(value.clone())?;
            }
        }
    }

    let downstreams: Vec<Arc<NodeInner>> = locked(&node.downstreams).clone();
    if downstreams.is_empty() {
        return Ok(vec![value]);
    }

    let mut collected = Vec::new();
    for downstream in downstreams {
        collected.extend(downstream.op.update(value.clone(), Some(node.id), &downstream)?);
    }
    Ok(collected)
}

/// Walks a node's connected component and returns its loop binding.
fn component_affinity(start: &Arc<NodeInner>) -> Option<ExecLoop> {
    let mut seen = HashSet::new();
    let mut pending = vec![start.clone()];
    while let Some(node) = pending.pop() {
        if !seen.insert(node.id) {
            continue;
        }
        if let Some(exec) = locked(&node.affinity).as_ref() {
            return Some(exec.clone());
        }
        pending.extend(locked(&node.downstreams).iter().cloned());
        pending.extend(locked(&node.upstreams).iter().filter_map(Weak::upgrade));
    }
    None
}

fn propagate_affinity(start: &Arc<NodeInner>, exec: &ExecLoop) {
    let mut seen = HashSet::new();
    let mut pending = vec![start.clone()];
    while let Some(node) = pending.pop() {
        if !seen.insert(node.id) {
            continue;
        }
        locked(&node.affinity).get_or_insert_with(|| exec.clone());
        pending.extend(locked(&node.downstreams).iter().cloned());
        pending.extend(locked(&node.upstreams).iter().filter_map(Weak::upgrade));
    }
}

/// Verifies that merging the given components would not join two
/// different event loops, and returns the loop the merged component
/// should carry. Checks before any mutation.
fn merged_affinity(parts: &[&Arc<NodeInner>]) -> Result<Option<ExecLoop>, StreamError> {
    let mut merged: Option<ExecLoop> = None;
    for part in parts {
        if let Some(exec) = component_affinity(part) {
            match &merged {
                Some(existing) if *existing != exec => {
                    return Err(ValidationError::ConflictingLoops {
                        left: existing.name(),
                        right: exec.name(),
                    }
                    .into());
                }
                Some(_) => {}
                None => merged = Some(exec),
            }
        }
    }
    Ok(merged)
}

fn link(up: &Arc<NodeInner>, down: &Arc<NodeInner>) -> Result<(), StreamError> {
    let merged = merged_affinity(&[up, down])?;
    link_unchecked(up, down, merged.as_ref());
    Ok(())
}

fn link_unchecked(up: &Arc<NodeInner>, down: &Arc<NodeInner>, merged: Option<&ExecLoop>) {
    locked(&up.downstreams).push(down.clone());
    locked(&down.upstreams).push(Arc::downgrade(up));
    if let Some(exec) = merged {
        propagate_affinity(up, exec);
    }
}

/// Handle to a stream graph node.
///
/// Clones refer to the same node. Operator methods create a new
/// downstream node and return a handle to it, so pipelines read as
/// chains: `source.map(..).filter(..).sink(..)`.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<NodeInner>,
}

impl Stream {
    /// A fresh source node with default settings.
    pub fn new() -> Stream {
        StreamBuilder::default().build()
    }

    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }

    /// Attaches a single-upstream operator. Linking one fresh node to
    /// an existing component cannot conflict, so this cannot fail.
    fn attach_infallible(&self, op: Box<dyn Operator>) -> Stream {
        let node = NodeInner::create(op, None, self.inner.refuse_none, None, None);
        let merged = component_affinity(&self.inner);
        link_unchecked(&self.inner, &node, merged.as_ref());
        Stream { inner: node }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Pushes a value into this node and returns the flattened results
    /// that reached non-sink leaves, in downstream insertion order.
    pub fn emit(&self, value: Value) -> Result<Vec<Value>, StreamError> {
        self.inner.op.update(value, None, &self.inner)
    }

    /// Binds this node's connected component to an event loop.
    pub fn bind_loop(&self, exec: &ExecLoop) -> Result<(), StreamError> {
        match component_affinity(&self.inner) {
            Some(existing) if existing != *exec => Err(ValidationError::ConflictingLoops {
                left: existing.name(),
                right: exec.name(),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                propagate_affinity(&self.inner, exec);
                Ok(())
            }
        }
    }

    /// The loop this node's component is bound to, if any.
    pub fn exec_loop(&self) -> Option<ExecLoop> {
        component_affinity(&self.inner)
    }

    /// Connects this node's output to an existing node's input.
    ///
    /// Fails with `ConflictingLoops` before mutating anything when the
    /// two components are bound to different event loops.
    pub fn connect(&self, downstream: &Stream) -> Result<(), StreamError> {
        link(&self.inner, &downstream.inner)
    }

    /// Removes a direct edge to `downstream`, if present.
    pub fn disconnect(&self, downstream: &Stream) {
        locked(&self.inner.downstreams).retain(|node| node.id != downstream.inner.id);
        locked(&downstream.inner.upstreams)
            .retain(|weak| weak.upgrade().map(|node| node.id) != Some(self.inner.id));
    }

    /// A non-owning handle to this node, for introspection registries
    /// that must never extend a node's lifetime.
    pub fn downgrade(&self) -> WeakStream {
        WeakStream {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Severs every edge touching this node. Upstreams stop delivering
    /// to it and its downstreams become reachable only through their
    /// other upstreams (or turn into orphan sources).
    pub fn destroy(&self) {
        let ups: Vec<Arc<NodeInner>> = locked(&self.inner.upstreams)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for up in ups {
            locked(&up.downstreams).retain(|node| node.id != self.inner.id);
        }
        let downs: Vec<Arc<NodeInner>> = locked(&self.inner.downstreams).drain(..).collect();
        for down in downs {
            locked(&down.upstreams)
                .retain(|weak| weak.upgrade().map(|node| node.id) != Some(self.inner.id));
        }
    }

    /// The single upstream of this node.
    pub fn upstream(&self) -> Result<Stream, StreamError> {
        let ups: Vec<Arc<NodeInner>> = locked(&self.inner.upstreams)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        match <[Arc<NodeInner>; 1]>::try_from(ups) {
            Ok([up]) => Ok(Stream { inner: up }),
            Err(ups) => Err(RoutingError::AmbiguousUpstream { count: ups.len() }.into()),
        }
    }

    // -- transforming operators ------------------------------------------

    pub fn map<F>(&self, f: F) -> Stream
    where
        F: Fn(Value) -> Result<Value, StreamError> + Send + Sync + 'static,
    {
        self.attach_infallible(Box::new(MapOp::new(f)))
    }

    pub fn filter<P>(&self, predicate: P) -> Stream
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.attach_infallible(Box::new(FilterOp::new(predicate)))
    }

    /// Drops values matching the predicate (the inverse of `filter`).
    pub fn remove<P>(&self, predicate: P) -> Stream
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter(move |value| !predicate(value))
    }

    /// Folds values into running state with `state = f(state, value)`,
    /// emitting each new state. Without a `start` the first value seeds
    /// the state and emits nothing.
    pub fn accumulate<F>(&self, f: F, start: Option<Value>) -> Stream
    where
        F: Fn(Value, Value) -> Result<Value, StreamError> + Send + Sync + 'static,
    {
        self.attach_infallible(Box::new(AccumulateOp::new(f, start)))
    }

    /// Like `accumulate`, but `f` returns `(state, emitted)` so the
    /// retained state and the emitted value can differ.
    pub fn accumulate_with<F>(&self, f: F, start: Option<Value>) -> Stream
    where
        F: Fn(Value, Value) -> Result<(Value, Value), StreamError> + Send + Sync + 'static,
    {
        self.attach_infallible(Box::new(AccumulateWithOp::new(f, start)))
    }

    /// Emits the last `n` values as one array once `n` have arrived,
    /// then again on every value (slide-by-one).
    pub fn sliding_window(&self, n: usize) -> Stream {
        self.attach_infallible(Box::new(SlidingWindowOp::new(n)))
    }

    /// Buffers values and emits the accumulated batch on a periodic
    /// tick, then resets. Requires the component to be bound to an
    /// event loop for the tick task.
    pub fn timed_window(&self, interval: Duration) -> Result<Stream, StreamError> {
        let exec = component_affinity(&self.inner).ok_or(ValidationError::LoopRequired {
            operator: "timed_window",
        })?;
        let buf = Arc::new(Mutex::new(Vec::new()));
        let node = NodeInner::create(
            Box::new(TimedWindowOp::new(buf.clone())),
            None,
            self.inner.refuse_none,
            None,
            None,
        );
        link_unchecked(&self.inner, &node, Some(&exec));

        let weak = Arc::downgrade(&node);
        exec.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { break };
                let batch = std::mem::take(&mut *locked(&buf));
                if let Err(err) = forward(&node, Value::Array(batch)) {
                    tracing::error!(operator = "timed_window", error = %err, "window flush failed");
                }
            }
        });

        Ok(Stream { inner: node })
    }

    /// Enforces a minimum spacing between downstream emissions by
    /// sleeping the emitting thread.
    pub fn rate_limit(&self, interval: Duration) -> Stream {
        self.attach_infallible(Box::new(RateLimitOp::new(interval)))
    }

    /// Decouples producer and consumer through a bounded queue drained
    /// on a dedicated thread; the producer suspends while the queue is
    /// full.
    pub fn buffer(&self, n: usize) -> Stream {
        // The drain thread needs a weak reference to the node that owns
        // the operator, so the node is built cyclically.
        let node = Arc::new_cyclic(|weak: &Weak<NodeInner>| NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            op: Box::new(BufferOp::start(n, weak.clone())),
            refuse_none: self.inner.refuse_none,
            downstreams: Mutex::new(Vec::new()),
            upstreams: Mutex::new(Vec::new()),
            affinity: Mutex::new(None),
            cache: Mutex::new(None),
            routes: Mutex::new(Vec::new()),
        });
        let merged = component_affinity(&self.inner);
        link_unchecked(&self.inner, &node, merged.as_ref());
        Stream { inner: node }
    }

    // -- terminal operators ----------------------------------------------

    /// Consumes values with `f`; nothing re-emits past a sink.
    pub fn sink<F>(&self, f: F) -> Stream
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.attach_infallible(Box::new(SinkOp::new(f)))
    }

    /// Collects everything flowing through this node.
    pub fn to_list(&self) -> Collected {
        let values: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let shared = values.clone();
        let _ = self.sink(move |value| locked(&shared).push(value));
        Collected { values }
    }

    /// Registers a predicate-gated handler on this node itself, without
    /// adding a downstream branch.
    pub fn route<P, F>(&self, predicate: P, handler: F) -> Stream
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        F: Fn(Value) -> Result<(), StreamError> + Send + Sync + 'static,
    {
        locked(&self.inner.routes).push(RouteEntry {
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        });
        self.clone()
    }

    // -- function wrappers -----------------------------------------------

    /// Wraps `f` so its result is fed into this stream on every call.
    /// Errors from `f` propagate to the caller untouched.
    pub fn catch<F>(&self, f: F) -> impl Fn(Value) -> Result<Vec<Value>, StreamError>
    where
        F: Fn(Value) -> Result<Value, StreamError> + Send + Sync + 'static,
    {
        let stream = self.clone();
        move |value| {
            let out = f(value)?;
            stream.emit(out)
        }
    }

    /// Like [`Stream::catch`], but a failure from `f` becomes a
    /// structured event `{function, param, except}` emitted into the
    /// stream instead of propagating.
    pub fn catch_except<F>(
        &self,
        function: impl Into<String>,
        f: F,
    ) -> impl Fn(Value) -> Result<Vec<Value>, StreamError>
    where
        F: Fn(Value) -> Result<Value, StreamError> + Send + Sync + 'static,
    {
        let stream = self.clone();
        let function = function.into();
        move |value| match f(value.clone()) {
            Ok(out) => stream.emit(out),
            Err(err) => stream.emit(serde_json::json!({
                "function": function,
                "param": value,
                "except": err.to_string(),
            })),
        }
    }

    // -- combining operators ---------------------------------------------

    /// Emits an array once every branch has produced a value since the
    /// last emit; each value is consumed exactly once.
    pub fn zip(&self, others: &[&Stream]) -> Result<Stream, StreamError> {
        combine::build(self, others, combine::Kind::Zip)
    }

    /// Same trigger as `zip`, but each branch contributes its most
    /// recent value rather than the strictly-next one.
    pub fn zip_latest(&self, others: &[&Stream]) -> Result<Stream, StreamError> {
        combine::build(self, others, combine::Kind::ZipLatest)
    }

    /// Emits on any branch's update using the last known value of all
    /// branches, once every branch has been seen at least once.
    pub fn combine_latest(&self, others: &[&Stream]) -> Result<Stream, StreamError> {
        combine::build(self, others, combine::Kind::CombineLatest { emit_on: None })
    }

    /// `combine_latest` restricted so only the listed branch indexes
    /// (0 = self) trigger emission.
    pub fn combine_latest_on(
        &self,
        others: &[&Stream],
        emit_on: Vec<usize>,
    ) -> Result<Stream, StreamError> {
        combine::build(
            self,
            others,
            combine::Kind::CombineLatest {
                emit_on: Some(emit_on),
            },
        )
    }

    // -- history ---------------------------------------------------------

    /// The `n` most recent values retained by this node's cache.
    pub fn recent(&self, n: usize) -> Vec<Value> {
        locked(&self.inner.cache)
            .as_ref()
            .map(|cache| cache.recent(n))
            .unwrap_or_default()
    }

    /// Cached values no older than `age`.
    pub fn recent_within(&self, age: Duration) -> Vec<Value> {
        locked(&self.inner.cache)
            .as_ref()
            .map(|cache| cache.recent_within(age))
            .unwrap_or_default()
    }
}

impl Default for Stream {
    fn default() -> Self {
        Stream::new()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("op", &self.inner.op.name())
            .finish()
    }
}

/// Non-owning stream handle. Upgrading yields `None` once every strong
/// handle to the node is gone.
pub struct WeakStream {
    inner: Weak<NodeInner>,
}

impl WeakStream {
    pub fn upgrade(&self) -> Option<Stream> {
        self.inner.upgrade().map(|inner| Stream { inner })
    }
}

/// Builder for source nodes with non-default settings.
#[derive(Default)]
pub struct StreamBuilder {
    name: Option<String>,
    exec: Option<ExecLoop>,
    cache: Option<CacheConfig>,
    keep_none: bool,
}

impl StreamBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_loop(mut self, exec: ExecLoop) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Lets null values flow instead of dropping them.
    pub fn keep_none(mut self) -> Self {
        self.keep_none = true;
        self
    }

    pub fn build(self) -> Stream {
        Stream {
            inner: NodeInner::create(
                Box::new(PassOp),
                self.name,
                !self.keep_none,
                self.exec,
                self.cache,
            ),
        }
    }
}

/// Snapshot handle produced by [`Stream::to_list`].
pub struct Collected {
    values: Arc<Mutex<Vec<Value>>>,
}

impl Collected {
    pub fn snapshot(&self) -> Vec<Value> {
        locked(&self.values).clone()
    }

    pub fn len(&self) -> usize {
        locked(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        locked(&self.values).is_empty()
    }
}
