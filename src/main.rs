// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use freshet::config::{load_config, RuntimeConfig};
use freshet::{observability, Runtime, Value};
use serde_json::json;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Synthetic tick source for the demo pipeline.
fn next_tick() -> Value {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    // A wobbly sawtooth is enough to make the moving average move.
    json!((n % 17) as f64 * 1.5)
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };
    observability::init(config.log_filter.as_deref());

    println!("🌊 freshet pipeline demo");
    println!("════════════════════════");
    match args.get(1) {
        Some(path) => println!("Config: {path}"),
        None => println!("Config: defaults (local broker, in-memory store)"),
    }
    println!();

    let runtime = Runtime::new(config)?;

    // Tick topic: values travel through the bus and back into a stream.
    let ticks = runtime.topic("ticks")?;
    ticks.pump();

    // Moving average over the last five ticks, printed as it updates.
    ticks
        .stream()
        .map(|value| Ok(json!(value.as_f64().unwrap_or(0.0))))
        .sliding_window(5)
        .map(|window| {
            let values = window.as_array().cloned().unwrap_or_default();
            let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
            Ok(json!(sum / values.len().max(1) as f64))
        })
        .sink(|avg| println!("  moving average: {avg}"));

    // Every tick also lands in a time-keyed table for later replay.
    let history = runtime.table("tick-history")?;

    println!("Publishing 25 ticks...");
    for _ in 0..25 {
        let tick = next_tick();
        history.emit(tick.clone())?;
        ticks.publish(tick)?;
        std::thread::sleep(Duration::from_millis(200));
    }

    let stored = history.range(None, None)?;
    println!();
    println!("Stored {} ticks; the last three:", stored.len());
    for (key, value) in stored.iter().rev().take(3).rev() {
        println!("  {key} => {value}");
    }

    Ok(())
}
