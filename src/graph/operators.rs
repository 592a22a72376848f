// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Single-upstream operators.
//!
//! Each operator computes zero or more outputs from one input and pushes
//! them through [`forward`], which owns caching, null-refusal, routes,
//! and fan-out.

use super::{forward, NodeInner, Operator};
use crate::errors::StreamError;
use crate::utils::locked;
use crate::Value;
use std::collections::VecDeque;
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Identity operator used for source nodes.
pub(crate) struct PassOp;

impl Operator for PassOp {
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        forward(node, value)
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

pub(crate) struct MapOp<F> {
    f: F,
}

impl<F> MapOp<F> {
    pub(crate) fn new(f: F) -> Self {
        MapOp { f }
    }
}

impl<F> Operator for MapOp<F>
where
    F: Fn(Value) -> Result<Value, StreamError> + Send + Sync,
{
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let out = (self.f)(value)?;
        forward(node, out)
    }

    fn name(&self) -> &'static str {
        "map"
    }
}

pub(crate) struct FilterOp<P> {
    predicate: P,
}

impl<P> FilterOp<P> {
    pub(crate) fn new(predicate: P) -> Self {
        FilterOp { predicate }
    }
}

impl<P> Operator for FilterOp<P>
where
    P: Fn(&Value) -> bool + Send + Sync,
{
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        if (self.predicate)(&value) {
            forward(node, value)
        } else {
            Ok(Vec::new())
        }
    }

    fn name(&self) -> &'static str {
        "filter"
    }
}

/// Running fold. With no start value, the first input seeds the state
/// without emitting.
pub(crate) struct AccumulateOp<F> {
    f: F,
    state: Mutex<Option<Value>>,
}

impl<F> AccumulateOp<F> {
    pub(crate) fn new(f: F, start: Option<Value>) -> Self {
        AccumulateOp {
            f,
            state: Mutex::new(start),
        }
    }
}

impl<F> Operator for AccumulateOp<F>
where
    F: Fn(Value, Value) -> Result<Value, StreamError> + Send + Sync,
{
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let next = {
            let mut state = locked(&self.state);
            match state.take() {
                None => {
                    *state = Some(value);
                    return Ok(Vec::new());
                }
                Some(prev) => {
                    let next = (self.f)(prev, value)?;
                    *state = Some(next.clone());
                    next
                }
            }
        };
        forward(node, next)
    }

    fn name(&self) -> &'static str {
        "accumulate"
    }
}

/// Fold whose function returns `(state, emitted)` separately.
pub(crate) struct AccumulateWithOp<F> {
    f: F,
    state: Mutex<Option<Value>>,
}

impl<F> AccumulateWithOp<F> {
    pub(crate) fn new(f: F, start: Option<Value>) -> Self {
        AccumulateWithOp {
            f,
            state: Mutex::new(start),
        }
    }
}

impl<F> Operator for AccumulateWithOp<F>
where
    F: Fn(Value, Value) -> Result<(Value, Value), StreamError> + Send + Sync,
{
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let emitted = {
            let mut state = locked(&self.state);
            match state.take() {
                None => {
                    *state = Some(value);
                    return Ok(Vec::new());
                }
                Some(prev) => {
                    let (next, emitted) = (self.f)(prev, value)?;
                    *state = Some(next);
                    emitted
                }
            }
        };
        forward(node, emitted)
    }

    fn name(&self) -> &'static str {
        "accumulate_with"
    }
}

/// Last-n window, emitted as one array on every value once full.
pub(crate) struct SlidingWindowOp {
    n: usize,
    window: Mutex<VecDeque<Value>>,
}

impl SlidingWindowOp {
    pub(crate) fn new(n: usize) -> Self {
        SlidingWindowOp {
            n,
            window: Mutex::new(VecDeque::with_capacity(n)),
        }
    }
}

impl Operator for SlidingWindowOp {
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let out = {
            let mut window = locked(&self.window);
            window.push_back(value);
            if window.len() < self.n {
                return Ok(Vec::new());
            }
            let out = Value::Array(window.iter().cloned().collect());
            window.pop_front();
            out
        };
        forward(node, out)
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}

/// Collects values between ticks; the tick task lives on the bound
/// event loop and flushes the shared buffer through the node.
pub(crate) struct TimedWindowOp {
    buf: Arc<Mutex<Vec<Value>>>,
}

impl TimedWindowOp {
    pub(crate) fn new(buf: Arc<Mutex<Vec<Value>>>) -> Self {
        TimedWindowOp { buf }
    }
}

impl Operator for TimedWindowOp {
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        _node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        locked(&self.buf).push(value);
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "timed_window"
    }
}

/// Minimum spacing between emissions; the emitting thread sleeps out
/// the remainder of the interval. Holding the lock across the sleep is
/// what serializes concurrent producers.
pub(crate) struct RateLimitOp {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimitOp {
    pub(crate) fn new(interval: Duration) -> Self {
        RateLimitOp {
            interval,
            last: Mutex::new(None),
        }
    }
}

impl Operator for RateLimitOp {
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        {
            let mut last = locked(&self.last);
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < self.interval {
                    std::thread::sleep(self.interval - elapsed);
                }
            }
            *last = Some(Instant::now());
        }
        forward(node, value)
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}

/// Bounded queue drained on a dedicated thread. `update` blocks the
/// producer while the queue is full; results past the buffer are not
/// reported back to the emitter.
pub(crate) struct BufferOp {
    tx: SyncSender<Value>,
}

impl BufferOp {
    pub(crate) fn start(n: usize, node: Weak<NodeInner>) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Value>(n);
        // The thread exits when the operator (and its sender) drops.
        let spawned = std::thread::Builder::new()
            .name("freshet-buffer".into())
            .spawn(move || {
                for value in rx.iter() {
                    let Some(node) = node.upgrade() else { break };
                    if let Err(err) = forward(&node, value) {
                        tracing::error!(operator = "buffer", error = %err, "drain failed");
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::error!(operator = "buffer", error = %err, "drain thread failed to start");
        }
        BufferOp { tx }
    }
}

impl Operator for BufferOp {
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        _node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        if self.tx.send(value).is_err() {
            tracing::warn!(operator = "buffer", "drain thread gone; value dropped");
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "buffer"
    }
}

/// Terminal consumer; nothing re-emits past it.
pub(crate) struct SinkOp<F> {
    f: F,
}

impl<F> SinkOp<F> {
    pub(crate) fn new(f: F) -> Self {
        SinkOp { f }
    }
}

impl<F> Operator for SinkOp<F>
where
    F: Fn(Value) + Send + Sync,
{
    fn update(
        &self,
        value: Value,
        _who: Option<u64>,
        _node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        (self.f)(value);
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "sink"
    }
}
