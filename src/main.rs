//! cowrite server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cowrite::server::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "cowrite", version, about = "Real-time collaborative document server")]
struct Args {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Name of the shared text branch; must match connecting clients.
    #[arg(long, default_value = "quill")]
    shared_type: String,

    /// Snapshot file path. Omit to disable persistence.
    #[arg(long)]
    persistence: Option<PathBuf>,

    /// Outbound frames buffered per peer before the peer is dropped.
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Seconds between periodic stats log lines (0 disables).
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.bind, args.port),
        shared_type: args.shared_type,
        persistence_path: args.persistence,
        queue_capacity: args.queue_capacity,
        stats_interval_secs: args.stats_interval,
        ..ServerConfig::default()
    };

    let server = SyncServer::new(config);
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
