//! gridsync server binary.
//!
//! Logging is controlled by `RUST_LOG` (e.g. `RUST_LOG=gridsync=debug`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gridsync::{Backend, FlushPolicy, GridLimits, ServerConfig, SyncServer};

/// Command line arguments. Every flag can also be set from the environment.
#[derive(Parser, Debug)]
#[command(name = "gridsync-server")]
#[command(about = "Real-time sync server for collaborative spreadsheets")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090", env = "GRIDSYNC_BIND_ADDR")]
    bind_addr: String,

    /// RocksDB directory for flushed documents; in-memory when omitted
    #[arg(long, value_name = "PATH", env = "GRIDSYNC_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Bus messages buffered per file before a slow server starts lagging
    #[arg(long, default_value_t = 256, env = "GRIDSYNC_BROADCAST_CAPACITY")]
    broadcast_capacity: usize,

    /// Frames queued per socket
    #[arg(long, default_value_t = 256, env = "GRIDSYNC_OUTBOUND_CAPACITY")]
    outbound_capacity: usize,

    /// Write attempts per flush
    #[arg(long, default_value_t = 5, env = "GRIDSYNC_FLUSH_ATTEMPTS")]
    flush_attempts: u32,

    /// Delay after the first failed flush attempt, doubled per retry
    #[arg(long, default_value_t = 200, env = "GRIDSYNC_FLUSH_BACKOFF_MS")]
    flush_backoff_ms: u64,

    /// Seconds between flushes of idle grids that are still cached (0 disables)
    #[arg(long, default_value_t = 60, env = "GRIDSYNC_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Smallest serialized drawing scene that is stored and relayed
    #[arg(long, default_value_t = 64, env = "GRIDSYNC_MIN_DRAWING_BYTES")]
    min_drawing_bytes: usize,

    /// Most rows or columns a single ROW_ADD/COL_ADD may add
    #[arg(long, default_value_t = 1_000, env = "GRIDSYNC_MAX_GROWTH")]
    max_growth: usize,

    /// Rows a grid may grow to
    #[arg(long, default_value_t = 100_000, env = "GRIDSYNC_MAX_ROWS")]
    max_rows: usize,

    /// Columns a grid may grow to
    #[arg(long, default_value_t = 1_024, env = "GRIDSYNC_MAX_COLUMNS")]
    max_columns: usize,

    /// Cells a grid may grow to
    #[arg(long, default_value_t = 5_000_000, env = "GRIDSYNC_MAX_CELLS")]
    max_cells: usize,
}

impl Args {
    fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            broadcast_capacity: self.broadcast_capacity,
            outbound_capacity: self.outbound_capacity,
            min_drawing_bytes: self.min_drawing_bytes,
            storage_path: self.storage_path,
            flush: FlushPolicy {
                max_attempts: self.flush_attempts,
                initial_backoff: Duration::from_millis(self.flush_backoff_ms),
                evict_on_failure: false,
            },
            max_growth: self.max_growth,
            grid_limits: GridLimits {
                max_rows: self.max_rows,
                max_columns: self.max_columns,
                max_cells: self.max_cells,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let sweep_interval = args.sweep_interval();
    let config = args.into_config();
    log::info!("Starting gridsync-server with {config:?}");

    let backend = Backend::open(&config)?;
    let server = Arc::new(SyncServer::new(config, backend));

    let sweeper = sweep_interval.map(|period| {
        let server = server.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = server.sweep().await;
                if !report.is_clean() {
                    log::warn!("Sweep left {} grids unflushed", report.failed.len());
                }
            }
        })
    });

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, flushing cached grids");
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    let report = server.shutdown().await;
    let stats = server.stats().await;
    log::info!(
        "Shutting down: {} connections served, {} flushes, {} flush failures, {} grids unflushed",
        stats.total_connections,
        stats.flushes,
        stats.flush_failures,
        report.failed.len()
    );

    Ok(())
}
