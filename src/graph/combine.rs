// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Multi-input operators: zip, zip_latest, combine_latest.
//!
//! A combining node keeps its branches in construction order and tells
//! arrivals apart by the upstream id carried in `who`. Loop-affinity
//! conflicts across all inputs are rejected before any edge is created.

use super::{forward, link_unchecked, merged_affinity, NodeInner, Operator, Stream};
use crate::errors::{RoutingError, StreamError};
use crate::utils::locked;
use crate::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub(super) enum Kind {
    Zip,
    ZipLatest,
    CombineLatest { emit_on: Option<Vec<usize>> },
}

pub(super) fn build(
    first: &Stream,
    others: &[&Stream],
    kind: Kind,
) -> Result<Stream, StreamError> {
    let mut inputs: Vec<&Stream> = Vec::with_capacity(others.len() + 1);
    inputs.push(first);
    inputs.extend_from_slice(others);

    let parts: Vec<&Arc<NodeInner>> = inputs.iter().map(|stream| &stream.inner).collect();
    let merged = merged_affinity(&parts)?;

    let branches: Vec<u64> = inputs.iter().map(|stream| stream.inner.id).collect();
    let count = branches.len();
    let op: Box<dyn Operator> = match kind {
        Kind::Zip => Box::new(ZipOp {
            branches,
            queues: Mutex::new(vec![VecDeque::new(); count]),
        }),
        Kind::ZipLatest => Box::new(ZipLatestOp {
            branches,
            state: Mutex::new(LatestState {
                latest: vec![None; count],
                fresh: vec![false; count],
            }),
        }),
        Kind::CombineLatest { emit_on } => Box::new(CombineLatestOp {
            branches,
            emit_on,
            latest: Mutex::new(vec![None; count]),
        }),
    };

    let node = NodeInner::create(op, None, first.inner.refuse_none, None, None);
    for input in &inputs {
        link_unchecked(&input.inner, &node, merged.as_ref());
    }
    Ok(Stream { inner: node })
}

fn branch_index(branches: &[u64], who: Option<u64>) -> Result<usize, StreamError> {
    let who = who.ok_or(RoutingError::UnknownBranch)?;
    let idx = branches
        .iter()
        .position(|id| *id == who)
        .ok_or(RoutingError::UnknownBranch)?;
    Ok(idx)
}

/// Emits once every branch has an unconsumed value; each value is
/// consumed exactly once, in arrival order per branch.
struct ZipOp {
    branches: Vec<u64>,
    queues: Mutex<Vec<VecDeque<Value>>>,
}

impl Operator for ZipOp {
    fn update(
        &self,
        value: Value,
        who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let idx = branch_index(&self.branches, who)?;
        let out = {
            let mut queues = locked(&self.queues);
            queues[idx].push_back(value);
            if queues.iter().all(|queue| !queue.is_empty()) {
                let tuple: Vec<Value> = queues
                    .iter_mut()
                    .map(|queue| queue.pop_front().unwrap_or(Value::Null))
                    .collect();
                Some(Value::Array(tuple))
            } else {
                None
            }
        };
        match out {
            Some(out) => forward(node, out),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &'static str {
        "zip"
    }
}

struct LatestState {
    latest: Vec<Option<Value>>,
    fresh: Vec<bool>,
}

/// Same trigger as zip, but each branch contributes its most recent
/// value; intermediate values on a busy branch are overwritten.
struct ZipLatestOp {
    branches: Vec<u64>,
    state: Mutex<LatestState>,
}

impl Operator for ZipLatestOp {
    fn update(
        &self,
        value: Value,
        who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let idx = branch_index(&self.branches, who)?;
        let out = {
            let mut state = locked(&self.state);
            state.latest[idx] = Some(value);
            state.fresh[idx] = true;
            if state.fresh.iter().all(|seen| *seen) {
                state.fresh.iter_mut().for_each(|seen| *seen = false);
                let tuple: Vec<Value> = state
                    .latest
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Value::Null))
                    .collect();
                Some(Value::Array(tuple))
            } else {
                None
            }
        };
        match out {
            Some(out) => forward(node, out),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &'static str {
        "zip_latest"
    }
}

/// Emits on any branch's update once every branch has been seen,
/// optionally restricted to a set of triggering branches.
struct CombineLatestOp {
    branches: Vec<u64>,
    emit_on: Option<Vec<usize>>,
    latest: Mutex<Vec<Option<Value>>>,
}

impl Operator for CombineLatestOp {
    fn update(
        &self,
        value: Value,
        who: Option<u64>,
        node: &Arc<NodeInner>,
    ) -> Result<Vec<Value>, StreamError> {
        let idx = branch_index(&self.branches, who)?;
        let out = {
            let mut latest = locked(&self.latest);
            latest[idx] = Some(value);
            let triggers = self
                .emit_on
                .as_ref()
                .map_or(true, |allowed| allowed.contains(&idx));
            if triggers && latest.iter().all(Option::is_some) {
                let tuple: Vec<Value> = latest
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Value::Null))
                    .collect();
                Some(Value::Array(tuple))
            } else {
                None
            }
        };
        match out {
            Some(out) => forward(node, out),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &'static str {
        "combine_latest"
    }
}
