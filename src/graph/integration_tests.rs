// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! End-to-end graph behavior: pipelines, fan-out ordering, loop
//! binding, routes, and error conversion.

use super::*;
use crate::cache::CacheConfig;
use serde_json::json;
use std::time::Instant;

#[test]
fn map_filter_pipeline_collects_expected_values() {
    let source = Stream::new();
    let collected = source
        .map(|value| Ok(json!(value.as_i64().unwrap_or(0) * 2)))
        .filter(|value| value.as_i64().unwrap_or(0) > 3)
        .to_list();

    for i in 0..5 {
        source.emit(json!(i)).unwrap();
    }
    assert_eq!(collected.snapshot(), vec![json!(4), json!(6), json!(8)]);
}

#[test]
fn emit_returns_values_reaching_non_sink_leaves() {
    let source = Stream::new();
    let _doubled = source.map(|value| Ok(json!(value.as_i64().unwrap_or(0) * 2)));
    assert_eq!(source.emit(json!(21)).unwrap(), vec![json!(42)]);
}

#[test]
fn every_sink_sees_emission_order() {
    let source = Stream::new();
    let sinks: Vec<_> = (0..3).map(|_| source.to_list()).collect();

    let values: Vec<Value> = (0..50).map(|i| json!(i)).collect();
    for value in &values {
        source.emit(value.clone()).unwrap();
    }
    for sink in &sinks {
        assert_eq!(sink.snapshot(), values);
    }
}

#[test]
fn conflicting_loops_fail_without_mutating_either_side() {
    let loop_a = ExecLoop::background().unwrap();
    let loop_b = ExecLoop::background().unwrap();

    let a = Stream::builder().with_loop(loop_a).build();
    let b = Stream::builder().with_loop(loop_b).build();
    let b_seen = b.to_list();

    let result = a.connect(&b);
    assert!(matches!(
        result,
        Err(StreamError::Validation(ValidationError::ConflictingLoops { .. }))
    ));

    // No edge was created: values emitted into `a` never reach `b`.
    a.emit(json!(1)).unwrap();
    assert!(b_seen.is_empty());
}

#[test]
fn connect_merges_affinity_into_the_unbound_side() {
    let exec = ExecLoop::background().unwrap();
    let bound = Stream::builder().with_loop(exec.clone()).build();
    let free = Stream::new();

    bound.connect(&free).unwrap();
    assert_eq!(free.exec_loop(), Some(exec));
}

#[test]
fn null_values_are_dropped_by_default_and_kept_on_request() {
    let strict = Stream::new();
    let strict_seen = strict.to_list();
    strict.emit(Value::Null).unwrap();
    assert!(strict_seen.is_empty());

    let lenient = Stream::builder().keep_none().build();
    let lenient_seen = lenient.to_list();
    lenient.emit(Value::Null).unwrap();
    assert_eq!(lenient_seen.snapshot(), vec![Value::Null]);
}

#[test]
fn routes_dispatch_by_content_without_branching() {
    let source = Stream::new();
    let evens = Arc::new(Mutex::new(Vec::new()));
    let odds = Arc::new(Mutex::new(Vec::new()));

    let evens_slot = evens.clone();
    let odds_slot = odds.clone();
    source
        .route(
            |value| value.as_i64().map(|n| n % 2 == 0).unwrap_or(false),
            move |value| {
                locked(&evens_slot).push(value);
                Ok(())
            },
        )
        .route(
            |value| value.as_i64().map(|n| n % 2 != 0).unwrap_or(false),
            move |value| {
                locked(&odds_slot).push(value);
                Ok(())
            },
        );

    for i in 0..6 {
        source.emit(json!(i)).unwrap();
    }
    assert_eq!(locked(&evens).clone(), vec![json!(0), json!(2), json!(4)]);
    assert_eq!(locked(&odds).clone(), vec![json!(1), json!(3), json!(5)]);
}

#[test]
fn catch_feeds_results_back_and_propagates_errors() {
    let source = Stream::new();
    let seen = source.to_list();
    let wrapped = source.catch(|value| match value.as_i64() {
        Some(n) => Ok(json!(n + 1)),
        None => Err(StreamError::handler("incr", "not a number")),
    });

    wrapped(json!(1)).unwrap();
    assert_eq!(seen.snapshot(), vec![json!(2)]);
    assert!(wrapped(json!("oops")).is_err());
    // The failed call emitted nothing.
    assert_eq!(seen.len(), 1);
}

#[test]
fn catch_except_converts_failure_into_a_structured_event() {
    let source = Stream::new();
    let seen = source.to_list();
    let wrapped = source.catch_except("parse_price", |value| match value.as_str() {
        Some(raw) => Ok(json!(raw.len())),
        None => Err(StreamError::handler("parse_price", "expected a string")),
    });

    wrapped(json!("abcd")).unwrap();
    wrapped(json!(7)).unwrap();

    let events = seen.snapshot();
    assert_eq!(events[0], json!(4));
    assert_eq!(events[1]["function"], json!("parse_price"));
    assert_eq!(events[1]["param"], json!(7));
    assert!(events[1]["except"]
        .as_str()
        .unwrap()
        .contains("expected a string"));
}

#[test]
fn upstream_requires_exactly_one_parent() {
    let source = Stream::new();
    let child = source.map(|value| Ok(value));
    assert_eq!(child.upstream().unwrap().id(), source.id());

    let other = Stream::new();
    other.connect(&child).unwrap();
    assert!(matches!(
        child.upstream(),
        Err(StreamError::Routing(RoutingError::AmbiguousUpstream { count: 2 }))
    ));

    assert!(matches!(
        source.upstream(),
        Err(StreamError::Routing(RoutingError::AmbiguousUpstream { count: 0 }))
    ));
}

#[test]
fn disconnect_removes_the_edge() {
    let source = Stream::new();
    let child = Stream::new();
    let seen = child.to_list();

    source.connect(&child).unwrap();
    source.emit(json!(1)).unwrap();
    source.disconnect(&child);
    source.emit(json!(2)).unwrap();

    assert_eq!(seen.snapshot(), vec![json!(1)]);
}

#[test]
fn destroy_severs_both_directions() {
    let source = Stream::new();
    let middle = source.map(|value| Ok(value));
    let seen = middle.map(|value| Ok(value)).to_list();

    source.emit(json!(1)).unwrap();
    middle.destroy();
    source.emit(json!(2)).unwrap();

    assert_eq!(seen.snapshot(), vec![json!(1)]);
    assert!(matches!(
        middle.upstream(),
        Err(StreamError::Routing(RoutingError::AmbiguousUpstream { count: 0 }))
    ));
    // The orphaned node still works as a standalone source.
    middle.emit(json!(3)).unwrap();
    assert_eq!(seen.snapshot(), vec![json!(1)]);
}

#[test]
fn timed_window_requires_a_loop() {
    let source = Stream::new();
    assert!(matches!(
        source.timed_window(Duration::from_millis(10)),
        Err(StreamError::Validation(ValidationError::LoopRequired {
            operator: "timed_window"
        }))
    ));
}

#[test]
fn timed_window_flushes_batches_on_ticks() {
    let exec = ExecLoop::background().unwrap();
    let source = Stream::builder().with_loop(exec).build();
    let batches = source
        .timed_window(Duration::from_millis(50))
        .unwrap()
        .filter(|batch| batch.as_array().map(|a| !a.is_empty()).unwrap_or(false))
        .to_list();

    for i in 0..3 {
        source.emit(json!(i)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while batches.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let first = batches.snapshot();
    assert_eq!(first[0], json!([0, 1, 2]));
}

#[test]
fn stream_cache_retains_bounded_history() {
    let source = Stream::builder()
        .cache(CacheConfig {
            max_len: Some(3),
            max_age: None,
        })
        .build();

    for i in 0..10 {
        source.emit(json!(i)).unwrap();
    }
    assert_eq!(source.recent(2), vec![json!(8), json!(9)]);
    assert_eq!(source.recent(10).len(), 3);
}

#[test]
fn remove_is_the_inverse_of_filter() {
    let source = Stream::new();
    let kept = source
        .remove(|value| value.as_i64().unwrap_or(0) % 2 == 0)
        .to_list();
    for i in 0..6 {
        source.emit(json!(i)).unwrap();
    }
    assert_eq!(kept.snapshot(), vec![json!(1), json!(3), json!(5)]);
}
