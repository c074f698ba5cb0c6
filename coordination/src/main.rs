//! Triad coordination CLI
//!
//! Replays recorded runs (JSON lines, one event per line) through the
//! event bus and state manager.
//!
//! # Usage
//!
//! ```bash
//! # Print the final snapshot of a run
//! triad-coordination replay run.jsonl
//!
//! # Write checkpoints while replaying
//! triad-coordination replay run.jsonl --checkpoint-dir ./checkpoints
//!
//! # Stream matching events
//! triad-coordination watch run.jsonl --pattern 'agent.*'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use triad_coordination::checkpoint::{CheckpointService, FileCheckpointStore};
use triad_coordination::{CoordinationConfig, Event, EventBus, StateManager, TraceBridge};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Per-subscriber queue capacity (overrides COORD_BUS_QUEUE_CAPACITY)
    #[arg(long, global = true)]
    queue_capacity: Option<usize>,

    /// Wait on a full subscriber queue in milliseconds (overrides COORD_BUS_PUT_TIMEOUT_MS)
    #[arg(long, global = true)]
    put_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay events into a state manager and print the final snapshot as JSON
    Replay {
        /// JSON-lines event file
        events: PathBuf,

        /// Write checkpoints to this directory (overrides COORD_CHECKPOINT_DIR)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Also log events matching this pattern through tracing
        #[arg(long)]
        pattern: Option<String>,

        /// Events retained for delta queries (overrides COORD_HISTORY_CAPACITY)
        #[arg(long)]
        history_capacity: Option<usize>,
    },
    /// Print events matching a pattern, one JSON object per line
    Watch {
        /// JSON-lines event file
        events: PathBuf,

        /// Glob over event types, e.g. `negotiation.*`
        #[arg(long, default_value = "*")]
        pattern: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triad_coordination=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = CoordinationConfig::from_env();
    if let Some(capacity) = args.queue_capacity {
        config.bus.default_capacity = capacity;
    }
    if let Some(ms) = args.put_timeout_ms {
        config.bus.put_timeout = Duration::from_millis(ms);
    }

    match args.command {
        Command::Replay {
            events,
            checkpoint_dir,
            pattern,
            history_capacity,
        } => {
            if let Some(dir) = checkpoint_dir {
                config.checkpoint.directory = Some(dir);
            }
            if let Some(n) = history_capacity {
                config.history_capacity = n;
            }
            replay(&events, config, pattern.as_deref()).await
        }
        Command::Watch { events, pattern } => watch(&events, config, &pattern).await,
    }
}

/// Read a JSON-lines event file. Blank lines are skipped.
async fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut events = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event = Event::from_json(&line)
            .with_context(|| format!("{}:{}: invalid event", path.display(), line_no))?;
        events.push(event);
    }

    tracing::info!(count = events.len(), path = %path.display(), "Loaded events");
    Ok(events)
}

async fn replay(path: &Path, config: CoordinationConfig, pattern: Option<&str>) -> Result<()> {
    let events = read_events(path).await?;

    let bus = EventBus::with_config(config.bus.clone());
    let manager = StateManager::with_history_capacity(bus.clone(), config.history_capacity);
    manager.start()?;

    let bridge = pattern.map(|p| TraceBridge::spawn(&bus, p));

    let checkpoints = match &config.checkpoint.directory {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "Checkpointing enabled");
            let service = CheckpointService::new(
                bus.clone(),
                manager.query(),
                Arc::new(FileCheckpointStore::new(dir)),
                config.checkpoint.clone(),
            );
            service.start()?;
            Some(service)
        }
        None => None,
    };

    let total = events.len() as u64;
    for event in events {
        bus.emit(event).await;
    }

    let settle = config.checkpoint.settle_timeout;
    if !manager.wait_for_version(total, settle).await {
        tracing::warn!(
            expected = total,
            applied = manager.version(),
            "State manager did not catch up; snapshot may be partial"
        );
    }

    if let Some(service) = &checkpoints {
        if !service.wait_for_seen(total, settle).await {
            tracing::warn!("Checkpoint service did not drain its queue before shutdown");
        }
        service.stop().await;
        tracing::info!(saved = service.saved_count(), "Checkpoints written");
    }
    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }
    manager.stop().await;

    let snapshot = manager.build_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn watch(path: &Path, config: CoordinationConfig, pattern: &str) -> Result<()> {
    let events = read_events(path).await?;

    let bus = EventBus::with_config(config.bus);
    let mut stream = bus.subscribe_with_capacity(pattern, events.len().max(1));

    for event in events {
        bus.emit(event).await;
    }
    while let Some(event) = stream.try_next() {
        println!("{}", event.to_json()?);
    }
    Ok(())
}
