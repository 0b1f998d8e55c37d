use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crownlink::{Config, Error, FileStore, PeerAddress, SessionCoordinator, Store};

/// LAN scroll relay client: finds the desktop receiver and streams scroll
/// deltas read from stdin to it.
#[derive(Parser, Debug)]
#[command(name = "crownlink", version, about)]
struct Args {
    /// Pin the receiver address (host or host:port), bypassing discovery.
    #[arg(long)]
    peer: Option<String>,

    /// Drop a previously pinned receiver address and rediscover.
    #[arg(long)]
    clear_peer: bool,

    /// Fallback registry base URL.
    #[arg(long)]
    registry_url: Option<String>,

    /// Where persisted state (client id, cached peer) lives.
    #[arg(long, default_value = "crownlink-state.json")]
    state_file: PathBuf,

    /// Write logs to daily-rotated files in this directory instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // Keep the guard alive for the lifetime of the process so buffered log
    // lines are flushed on exit.
    let _log_guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crownlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    let mut config = Config::default();
    if let Some(url) = args.registry_url.clone() {
        config.registry_url = url;
    }
    let default_port = config.peer_port;

    let store: Arc<dyn Store> = Arc::new(FileStore::open(&args.state_file));
    let (frames_tx, mut frames_rx) = mpsc::channel(64);
    let session = SessionCoordinator::spawn(config, store, frames_tx);

    if args.clear_peer {
        session.clear_manual_address().await?;
    }
    if let Some(peer) = &args.peer {
        let address = PeerAddress::parse(peer, default_port)?;
        session.set_manual_address(address).await?;
    }

    // Status transitions go to stdout so they are visible without the logs.
    let mut status_rx = session.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            match &status.address {
                Some(addr) => println!("[{}] {} ({})", status.status, addr, status.source),
                None => println!("[{}]", status.status),
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            tracing::debug!("frame from peer: {}", frame);
        }
    });

    // Each stdin line is a scroll delta in pixels, or one of a few commands.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "quit" => break,
            "reconnect" => session.reconnect().await?,
            "status" => {
                let status = session.status();
                println!(
                    "connected={} status={:?} address={:?} source={} discovered={:?}",
                    status.connected, status.status, status.address, status.source, status.discovered
                );
            }
            "auto" => session.clear_manual_address().await?,
            other => {
                if let Some(rest) = other.strip_prefix("peer ") {
                    match PeerAddress::parse(rest, default_port) {
                        Ok(address) => session.set_manual_address(address).await?,
                        Err(e) => eprintln!("invalid address: {}", e),
                    }
                } else {
                    match other.parse::<f64>() {
                        Ok(pixels) => session.submit_pixels(pixels).await?,
                        Err(_) => eprintln!("unrecognized input: {}", other),
                    }
                }
            }
        }
    }

    session.shutdown().await.ok();
    Ok(())
}
