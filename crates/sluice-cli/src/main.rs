use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice_core::app::{HandlerContext, HandlerError, RecordHandler};
use sluice_core::domain::{GroupKey, NewOutboxRecord, OUTBOX_TABLE, OutboxEnvelope};
use sluice_core::impls::{InMemoryBroker, InMemoryLedger};
use sluice_core::{DispatcherBuilder, DispatcherConfig};

/// Run the outbox pipeline against the in-memory store and broker.
#[derive(Debug, Parser)]
#[command(name = "sluice", version)]
struct Args {
    /// Records to seed per group.
    #[arg(long, default_value_t = 1_000)]
    records: i64,

    /// Number of group keys.
    #[arg(long, default_value_t = 4)]
    groups: usize,

    /// JSON config file (camelCase option names); SLUICE_* env vars otherwise.
    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Fraction of broker sends that fail, 0.0..=1.0.
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Give up waiting for the backlog after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the outbox table DDL (table plus filtered indexes) and exit.
    #[arg(long)]
    print_schema: bool,
}

/// consumer 側の処理: 受け取ったレコードをログに出すだけ
struct LoggingHandler;

#[async_trait]
impl RecordHandler for LoggingHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &OutboxEnvelope,
    ) -> Result<(), HandlerError> {
        tracing::debug!(
            member = %ctx.member,
            partition = %ctx.partition,
            record_id = %envelope.record_id,
            group_key = %envelope.group_key,
            rank = envelope.rank,
            "handled"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.print_schema {
        print!("{}", OUTBOX_TABLE.create_table_sql());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => DispatcherConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DispatcherConfig::from_env(),
    };

    // (A) store と broker を用意して seed
    let ledger = Arc::new(InMemoryLedger::from_config(&config));
    let broker = InMemoryBroker::default().with_failure_rate(args.failure_rate);
    for g in 0..args.groups {
        let key = GroupKey::new(format!("group-{g}"))?;
        ledger.insert_many(
            (0..args.records).map(|rank| NewOutboxRecord::new(key.clone(), rank, format!("{key}:{rank}"))),
        );
    }
    let total = args.records.max(0) as u64 * args.groups as u64;
    info!(total, groups = args.groups, "seeded outbox");

    // (B) dispatcher と consumer group を起動
    let dispatcher = DispatcherBuilder::new(config)
        .ledger(ledger.clone())
        .broker(Arc::new(broker.clone()))
        .consumers(Arc::new(broker.clone()), Arc::new(LoggingHandler))
        .start()
        .await?;
    let control = dispatcher.control();

    // (C) 全件 processed か、タイムアウト、Ctrl-C まで待つ
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("timed out before the backlog drained");
                break;
            }
            _ = ticker.tick() => {
                let status = control.status().await;
                let done = status.backlog == Some(0)
                    && status.unreceived == Some(0)
                    && status.pending_status_updates == 0;
                if done {
                    info!("backlog drained");
                    break;
                }
            }
        }
    }

    // (D) 順序付きシャットダウン
    let report = dispatcher.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(
        published = broker.published_count(),
        processed = ledger.records().iter().filter(|r| r.is_processed()).count(),
        clean = report.is_clean(),
        "done"
    );
    Ok(())
}
