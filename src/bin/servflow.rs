//! servflow runtime
//!
//! Reads newline-delimited JSON events from a file (optionally following it)
//! or stdin, runs them through the partitioned pipeline into SQLite, and logs
//! a live dashboard until the input ends or CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin servflow -- [EVENTS.jsonl] [--follow]
//!   cargo run --bin event_generator -- stream 20 | cargo run --bin servflow
//!
//! Environment variables (see `PipelineConfig::from_env`):
//!   SERVFLOW_DB_PATH - SQLite database path (default: data/servflow.db)
//!   PARTITION_COUNT - Number of partition workers
//!   FLUSH_INTERVAL_MS - Flush interval
//!   SERVFLOW_CLOCK - `system` or `event_time` (use `event_time` for replays)

use dotenv::dotenv;
use log::{error, info, warn};
use servflow::pipeline::{
    db_reader::StoreReader,
    source::{EventSource, JsonlSource},
    EventSink, EventType, Pipeline, PipelineConfig, QueryHandle, SqliteEventSink, WindowSize,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};

const DASHBOARD_INTERVAL_SECS: u64 = 10;
const SOURCE_BATCH: usize = 500;

fn pct(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

fn log_dashboard(pipeline: &Pipeline, handle: &QueryHandle, started: Instant) {
    let stats = pipeline.stats();
    let elapsed = started.elapsed().as_secs_f64().max(1e-9);

    info!("📊 ─── Dashboard (last {}) ───", WindowSize::Min5.as_str());
    for lw in handle.location_windows(WindowSize::Min5) {
        info!(
            "   ├─ {} {}: ${:.2} revenue, {} orders, seat→pay {}, kitchen {}",
            lw.location_id,
            lw.location_name,
            lw.acc.revenue,
            lw.acc.order_count,
            pct(lw.acc.conversion(EventType::TableSeated, EventType::Payment)),
            lw.acc
                .avg_kitchen_minutes()
                .map(|m| format!("{:.1}m", m))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    let top = handle.top_items(WindowSize::Min30, 3);
    if !top.is_empty() {
        let names: Vec<String> = top
            .iter()
            .map(|r| format!("{} ({})", r.item_name, r.total_quantity))
            .collect();
        info!("   ├─ Top items ({}): {}", WindowSize::Min30.as_str(), names.join(", "));
    }

    info!(
        "   ├─ Events: {} received, {} accepted, {} duplicates, {} rejected ({:.2}%), {} too late",
        stats.received,
        stats.accepted,
        stats.duplicates,
        stats.rejected,
        stats.rejection_rate() * 100.0,
        stats.too_late
    );
    info!(
        "   ├─ Funnels: {} live, {} completed, {} expired, {} abandoned",
        handle.live_funnels(),
        stats.funnels_completed,
        stats.funnels_expired,
        stats.funnels_abandoned
    );
    info!(
        "   └─ Throughput: {:.1} events/sec, queues {:?}, {} rows written, {} flush failures",
        stats.received as f64 / elapsed,
        pipeline.queue_depths(),
        stats.rows_written,
        stats.flush_failures
    );
}

fn log_summary(db_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let reader = StoreReader::open(db_path)?;
    let now = chrono::Utc::now().timestamp();
    let window = WindowSize::Hour1.duration_secs();

    info!("📋 Stored summary (last {})", WindowSize::Hour1.as_str());
    info!("   ├─ Raw events: {}", reader.raw_event_count()?);
    for row in reader.revenue_by_location(window, now)? {
        info!(
            "   ├─ {} {}: ${:.2} revenue, ${:.2} tips, {} orders, avg ticket {}",
            row.location_id,
            row.location_name,
            row.revenue,
            row.tips,
            row.order_count,
            row.avg_ticket()
                .map(|t| format!("${:.2}", t))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    for row in reader.funnel_by_location(window, now)? {
        info!(
            "   ├─ {} funnel: seat→order {}, order→complete {}, complete→pay {}",
            row.location_id,
            pct(row.seat_to_order()),
            pct(row.order_to_complete()),
            pct(row.complete_to_pay())
        );
    }
    for item in reader.top_items(window, now, 5)? {
        info!(
            "   ├─ {} [{}]: {} sold in {} orders",
            item.item_name, item.category, item.total_quantity, item.order_count
        );
    }
    for (code, count) in reader.dead_letter_counts()? {
        info!("   ├─ Dead-lettered {}: {}", code, count);
    }
    info!("   └─ Database: {}", db_path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let follow = args.iter().any(|a| a == "--follow" || a == "-f");
    let path = args.iter().find(|a| !a.starts_with('-')).map(PathBuf::from);

    let config = PipelineConfig::from_env()?;
    info!("🔧 Initializing database: {}", config.db_path);
    let sink: Arc<dyn EventSink> = Arc::new(SqliteEventSink::open(&config.db_path)?);
    info!("✅ Database initialized");

    let mut source: Box<dyn EventSource> = match path {
        Some(path) => Box::new(JsonlSource::open(path, follow).await?),
        None => Box::new(JsonlSource::stdin()),
    };

    let db_path = config.db_path.clone();
    let pipeline = Pipeline::start(config, sink)?;
    let handle = pipeline.handle();
    let started = Instant::now();

    info!("🔄 Press CTRL+C to shutdown gracefully");

    {
        let ingest = pipeline.ingest_from(source.as_mut(), SOURCE_BATCH);
        tokio::pin!(ingest);

        let mut dashboard = interval(Duration::from_secs(DASHBOARD_INTERVAL_SECS));
        dashboard.tick().await;

        loop {
            tokio::select! {
                result = &mut ingest => {
                    match result {
                        Ok(n) => info!("✅ Input exhausted after {} records", n),
                        Err(e) => error!("❌ Ingestion stopped: {}", e),
                    }
                    break;
                }
                _ = dashboard.tick() => log_dashboard(&pipeline, &handle, started),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => warn!("⚠️  Received CTRL+C, shutting down..."),
                        Err(e) => error!("❌ Failed to listen for CTRL+C: {}", e),
                    }
                    break;
                }
            }
        }
    }

    log_dashboard(&pipeline, &handle, started);
    let reports = pipeline.shutdown().await;
    for report in &reports {
        if let Some(fault) = &report.last_fault {
            warn!(
                "⚠️  Partition {}: {} fatal faults, {} rows unwritten (last: {})",
                report.partition, report.fatal_faults, report.held_rows, fault
            );
        }
    }

    if let Err(e) = log_summary(&db_path) {
        error!("❌ Failed to read summary: {}", e);
    }

    info!("✅ servflow stopped");
    Ok(())
}
