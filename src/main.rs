/// Main entry point for the game RPC daemon
///
/// Sets up logging, parses command line arguments, then hands over to the
/// daemon: handshake with the parent process on stdin/stdout, then serve.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use game_rpcd::{Daemon, DaemonConfig, TransportKind};

/// Get the default database path, falling back from the data directory to
/// the home directory and finally the temporary directory
fn get_default_database_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let potential_paths = [
        dirs::data_dir().map(|mut p| {
            p.push("game-rpcd");
            p
        }),
        dirs::home_dir().map(|mut p| {
            p.push(".game-rpcd");
            p
        }),
    ];

    for potential_path in potential_paths.iter().flatten() {
        if std::fs::create_dir_all(potential_path).is_ok() {
            return Ok(potential_path.join("daemon.db"));
        }
    }

    let mut temp_path = std::env::temp_dir();
    temp_path.push("game-rpcd");
    std::fs::create_dir_all(&temp_path)?;
    temp_path.push("daemon.db");

    tracing::warn!("Using temporary directory for database: {}", temp_path.display());
    Ok(temp_path)
}

/// Command line arguments for the daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport to serve RPC traffic on
    #[arg(long, value_enum, default_value = "tcp")]
    transport: TransportKind,

    /// Address to listen on (tcp and http transports)
    #[arg(long, default_value = "127.0.0.1:0")]
    address: String,

    /// Keep accepting TCP connections instead of serving only the first
    #[arg(long)]
    keep_alive: bool,

    /// Path to the SQLite database file
    /// If not provided, uses a default location in the user's data directory
    #[arg(long)]
    database: Option<PathBuf>,

    /// Number of database connections leased to handlers
    #[arg(long, default_value_t = 4)]
    db_pool_size: usize,

    /// How long to wait for the parent to send the secret
    #[arg(long, default_value_t = 15)]
    secret_timeout_secs: u64,

    /// Minimum accepted secret length
    #[arg(long, default_value_t = 256)]
    min_secret_length: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output (implies debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else if args.debug {
        "info"
    } else {
        "warn"
    };

    // stdout carries the handshake (and RPC traffic with --transport stdio)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("game_rpcd={}", log_level))),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting game RPC daemon");

    let database = match args.database {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            path
        }
        None => get_default_database_path()?,
    };
    info!("Using database at: {}", database.display());

    let config = DaemonConfig {
        transport: args.transport,
        address: args.address,
        keep_alive: args.keep_alive,
        database: Some(database),
        db_pool_size: args.db_pool_size,
        secret_timeout: Duration::from_secs(args.secret_timeout_secs),
        min_secret_length: args.min_secret_length,
        ..DaemonConfig::default()
    };

    Daemon::new(config).run().await?;

    info!("Game RPC daemon shutdown complete");
    Ok(())
}
