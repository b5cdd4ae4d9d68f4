// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-engine usage example.
//!
//! Demonstrates:
//! 1. Starting the engine over a SQLite store and a scripted transport
//! 2. Priority dispatch (critical traffic jumps the queue)
//! 3. Automatic retry with exponential backoff on a flaky endpoint
//! 4. Degrading to 2g: adaptive timeout and a smaller concurrency cap
//! 5. Going offline: queued mutations, cached reads, fail-fast fetches
//! 6. Reconnecting: the backlog replays immediately
//! 7. Displaying metrics (OTEL-compatible)
//! 8. Clean shutdown
//!
//! The transport is the scripted mock, so the example runs with no network
//! and no services. Swap in a real [`offline_engine::Transport`]
//! implementation to drive actual HTTP traffic.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

use offline_engine::{
    EngineConfig, EngineState, FetchError, LinkHints, ManualSignals, MockTransport, OfflineEngine,
    Priority, QualityClass, RequestOptions,
};

const DEMO_DB: &str = "./offline_demo.db";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-engine: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring offline-engine...");

    let transport = Arc::new(MockTransport::new());
    transport.set_latency(Duration::from_millis(10));
    let signals = ManualSignals::new();

    let config = EngineConfig {
        // Durable store on disk; queued work survives restarts
        db_path: Some(DEMO_DB.into()),
        ..Default::default()
    };

    let engine = OfflineEngine::new(config, transport.clone(), &signals).await?;
    println!("   State: {:?}", engine.state());

    println!("\n🚀 Starting engine...");
    engine.start().await;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine running! State: {:?}", engine.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Priority dispatch: critical traffic jumps the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚦 Dispatching with priorities (paused so the queue builds up)...");

    engine.dispatcher().pause();
    let handles = vec![
        engine
            .dispatcher()
            .enqueue("log/upload", RequestOptions::get(), Priority::Background),
        engine
            .dispatcher()
            .enqueue("fleet/manifest", RequestOptions::get(), Priority::Medium),
        engine
            .dispatcher()
            .enqueue("vessel/mayday", RequestOptions::get(), Priority::Critical),
    ];
    println!(
        "   └─ Waiting by priority: {:?}",
        engine.dispatcher().status().waiting_by_priority
    );
    engine.dispatcher().resume();
    for handle in handles {
        handle.wait().await?;
    }
    println!("   └─ Executed order: {:?}", transport.call_order());
    println!("   ⚡ Critical ran before the medium and background work");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Automatic retry against a flaky endpoint
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔁 Fetching a flaky endpoint (two 503s before it recovers)...");

    transport.fail_times("vessel/position", FetchError::Remote { status: 503 }, 2);
    let response = engine
        .monitor()
        .fetch_with_retry(
            "vessel/position",
            &RequestOptions::post(json!({"lat": 57.33, "lon": -1.98})),
            None,
        )
        .await?;
    println!(
        "   └─ Succeeded with status {} after {} attempts",
        response.status,
        transport.calls("vessel/position")
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Link degrades to 2g
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Link degrades to 2g...");

    signals.link_change(LinkHints::quality(QualityClass::TwoG));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = engine.monitor().state();
    println!("   └─ Quality: {:?} (slow: {})", state.quality, state.is_slow());
    println!("   └─ Adaptive fetch timeout: {:?}", state.adaptive_timeout());
    println!(
        "   └─ Dispatcher concurrency cap: {}",
        engine.dispatcher().status().max_concurrent
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Offline: queue mutations, serve cached reads, fail fast
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✈️  Going offline...");

    engine
        .queue()
        .cache_data("harbor/weather", json!({"wind_kts": 23, "swell_m": 1.4}), Duration::from_secs(300))
        .await?;

    signals.offline();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls_before = transport.total_calls();
    engine
        .queue()
        .queue_action("vessel/position", json!({"lat": 57.35, "lon": -1.92}))
        .await?;
    engine
        .queue()
        .queue_action("vessel/eta", json!({"port": "ABZ", "eta": "2026-08-25T18:40Z"}))
        .await?;
    println!(
        "   └─ Queued 2 mutations ({} pending, wire untouched: {})",
        engine.health().await.pending_actions,
        transport.total_calls() == calls_before
    );

    match engine.queue().get_cached("harbor/weather").await? {
        Some(weather) => println!("   └─ Cached read served offline: {}", weather),
        None => println!("   └─ Cache miss (unexpected)"),
    }

    let err = engine
        .monitor()
        .fetch("fleet/status", &RequestOptions::get())
        .await
        .expect_err("offline fetch fails fast");
    println!("   └─ Live fetch failed fast: {}", err);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Reconnect: the backlog replays immediately
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📡 Connectivity regained...");

    signals.online();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let health = engine.health().await;
    println!("   └─ Pending actions after replay: {}", health.pending_actions);
    if let Some(report) = engine.sync().last_report() {
        println!(
            "   └─ Last pass: {} replayed, {} failed, took {:?}",
            report.actions_replayed, report.actions_failed, report.duration
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Dump raw metrics (OTEL-compatible)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 8. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {:?}", engine.state());

    println!("\n🧹 Cleaning up demo database...");
    for path in [
        DEMO_DB.to_string(),
        format!("{DEMO_DB}-wal"),
        format!("{DEMO_DB}-shm"),
    ] {
        let _ = std::fs::remove_file(path);
    }
    println!("   ✅ Cleanup complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
        let name = key.name();
        let labels: Vec<_> = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => counters.push((name.to_string(), label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name.to_string(), label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name.to_string(), label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }

    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
