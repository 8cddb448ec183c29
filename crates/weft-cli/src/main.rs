//! WEFT command-line interface
//!
//! Runs a rendezvous hub or a storage worker, and sends or fetches content
//! as a client.

mod config;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use weft_core::{PeerId, Role, RootHash};
use weft_files::{Chunker, ContentStore, FsStore, MemoryStore, PieceDigest, PieceSizePolicy};
use weft_mesh::{Connector, HubServer, MeshNode, NodeEvent, NodeHandle, RtcConnector, bootstrap};

use config::Config;
use progress::{TransferProgress, format_bytes, format_duration};

/// WEFT - peer mesh file exchange
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous hub
    Hub {
        /// WebSocket listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a storage worker
    Worker {
        /// Hub WebSocket URL
        #[arg(long)]
        hub: Option<String>,

        /// Content directory
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Send or fetch content through a worker
    Client {
        /// Hub WebSocket URL
        #[arg(long)]
        hub: Option<String>,

        #[command(subcommand)]
        action: ClientAction,
    },

    /// Print the root hash and piece layout of a file
    Hash {
        /// File to hash
        #[arg(required = true)]
        file: PathBuf,

        /// Pick the piece size from the file size
        #[arg(long)]
        graduated: bool,

        /// Use BLAKE3 instead of SHA-256
        #[arg(long)]
        blake3: bool,

        /// Print every piece hash
        #[arg(long)]
        pieces: bool,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Upload a file to the assigned worker
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Download content by root hash
    Fetch {
        /// Hex root hash
        #[arg(required = true)]
        root: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Hub { listen } => {
            if let Some(listen) = listen {
                config.hub.listen_addr = listen;
            }
            run_hub(&config).await?;
        }
        Commands::Worker { hub, store } => {
            if let Some(hub) = hub {
                config.bootstrap.hub_url = hub;
            }
            if let Some(store) = store {
                config.transfer.store_dir = store;
            }
            config.validate()?;
            run_worker(&config).await?;
        }
        Commands::Client { hub, action } => {
            if let Some(hub) = hub {
                config.bootstrap.hub_url = hub;
            }
            config.validate()?;
            match action {
                ClientAction::Send { file } => send_file(&config, &file).await?,
                ClientAction::Fetch { root, output } => {
                    fetch_content(&config, &parse_root(&root)?, &output).await?;
                }
            }
        }
        Commands::Hash {
            file,
            graduated,
            blake3,
            pieces,
        } => {
            if graduated {
                config.transfer.graduated = true;
            }
            if blake3 {
                config.transfer.digest = PieceDigest::Blake3;
            }
            hash_file(&config, &file, pieces).await?;
        }
    }

    Ok(())
}

fn connector(config: &Config) -> Arc<dyn Connector> {
    Arc::new(RtcConnector::new(config.rtc.ice_servers.clone()))
}

fn parse_root(text: &str) -> anyhow::Result<RootHash> {
    let bytes = hex::decode(text.trim()).context("root hash is not hex")?;
    RootHash::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("root hash must be 32 bytes, got {}", bytes.len()))
}

/// Run a hub until Ctrl+C
async fn run_hub(config: &Config) -> anyhow::Result<()> {
    let hub_config = config.hub_config()?;
    let node = MeshNode::hub(
        config.node_config(),
        &hub_config,
        connector(config),
        Arc::new(MemoryStore::new()),
    );
    let id = node.id();
    let (handle, task) = node.spawn();
    let server = HubServer::bind(&hub_config, handle.clone()).await?;

    println!("WEFT Hub");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Id: {id}");
    println!("Listen: ws://{}", server.local_addr()?);
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\nShutting down..."),
    }
    handle.shutdown().await?;
    task.await?;
    Ok(())
}

/// Run a worker until Ctrl+C or until the hub link is lost
async fn run_worker(config: &Config) -> anyhow::Result<()> {
    let store = FsStore::open(&config.transfer.store_dir).await?;
    println!("WEFT Worker");
    println!("Store: {}", store.dir().display());
    println!("Hub: {}", config.bootstrap.hub_url);

    let node = MeshNode::new(
        Role::Worker,
        config.node_config(),
        connector(config),
        Arc::new(store),
    );
    let (handle, task) = node.spawn();
    let mut events = handle.subscribe();
    let hub = bootstrap(&config.bootstrap_config(true), &handle).await?;
    println!("Joined mesh via hub {}", hub.short());
    println!("Press Ctrl+C to stop");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(NodeEvent::PeerClosed { peer }) if peer == hub => {
                    break Err(anyhow::anyhow!("lost link to hub"));
                }
                Ok(NodeEvent::PeerConnected { peer }) => {
                    tracing::info!(peer = %peer.short(), "peer connected");
                }
                Ok(NodeEvent::ImportComplete { root, name, size }) => {
                    println!("Stored {name} ({}) as {}", format_bytes(size), hex::encode(root));
                }
                Ok(NodeEvent::TransferFailed { root, reason }) => {
                    tracing::warn!(root = %hex::encode(root), %reason, "incoming transfer failed");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break Err(anyhow::anyhow!("node stopped"));
                }
            },
        }
    };

    handle.shutdown().await.ok();
    task.await?;
    outcome
}

/// Bootstrap a client and wait for the hub to pair it with a worker
async fn join_as_client(
    config: &Config,
    store: Arc<dyn ContentStore>,
) -> anyhow::Result<(NodeHandle, broadcast::Receiver<NodeEvent>, PeerId)> {
    let node = MeshNode::new(Role::Client, config.node_config(), connector(config), store);
    let (handle, _task) = node.spawn();
    let mut events = handle.subscribe();

    let spinner = TransferProgress::spinner("Joining mesh...");
    let hub = bootstrap(&config.bootstrap_config(false), &handle).await?;
    spinner.set_message(format!("Joined via hub {}, waiting for a worker...", hub.short()));

    let existing = handle
        .snapshot()
        .await?
        .connected
        .into_iter()
        .find(|peer| *peer != hub);
    let worker = match existing {
        Some(worker) => worker,
        None => {
            let wait = config.bootstrap_config(false).connect_timeout;
            tokio::time::timeout(wait, async {
                loop {
                    match events.recv().await {
                        Ok(NodeEvent::PeerConnected { peer }) if peer != hub => return Ok(peer),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(anyhow::anyhow!("node stopped"));
                        }
                    }
                }
            })
            .await
            .context("no worker reached us")??
        }
    };
    spinner.finish_with_message(format!("Paired with worker {}", worker.short()));
    Ok((handle, events, worker))
}

/// Upload a file to the assigned worker
async fn send_file(config: &Config, file: &Path) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let size = std::fs::metadata(file)?.len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(size));

    let (handle, mut events, worker) =
        join_as_client(config, Arc::new(MemoryStore::new())).await?;
    let started = Instant::now();
    let root = handle.upload(worker, file).await?;
    println!("Root: {}", hex::encode(root));

    let progress = TransferProgress::new(0, &filename);
    loop {
        match events.recv().await {
            Ok(NodeEvent::UploadProgress {
                root: r,
                acked,
                total,
                ..
            }) if r == root => {
                progress.update(acked, total);
                if acked == total {
                    progress.finish_with_message(format!(
                        "Uploaded {filename} in {}",
                        format_duration(started.elapsed())
                    ));
                    break;
                }
            }
            Ok(NodeEvent::UploadRejected { root: r, .. }) if r == root => {
                progress.finish_with_message("Worker already holds this content".to_string());
                break;
            }
            Ok(NodeEvent::TransferFailed { root: r, reason }) if r == root => {
                progress.abandon(format!("Upload failed: {reason}"));
                anyhow::bail!("upload failed: {reason}");
            }
            Ok(NodeEvent::PeerClosed { peer }) if peer == worker => {
                progress.abandon("Worker disconnected".to_string());
                anyhow::bail!("worker disconnected during upload");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("node stopped"),
        }
    }

    handle.shutdown().await.ok();
    Ok(())
}

/// Download content from the assigned worker into `output`
async fn fetch_content(config: &Config, root: &RootHash, output: &Path) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (handle, mut events, worker) = join_as_client(config, store.clone()).await?;
    handle.download(worker, *root).await?;

    let progress = TransferProgress::spinner(&format!("Fetching {}...", hex::encode(root)));
    let (name, size) = loop {
        match events.recv().await {
            Ok(NodeEvent::ImportComplete { root: r, name, size }) if r == *root => {
                break (name, size);
            }
            Ok(NodeEvent::DownloadMissing { root: r, .. }) if r == *root => {
                progress.abandon("Worker does not hold this content".to_string());
                anyhow::bail!("content not found");
            }
            Ok(NodeEvent::TransferFailed { root: r, reason }) if r == *root => {
                progress.abandon(format!("Download failed: {reason}"));
                anyhow::bail!("download failed: {reason}");
            }
            Ok(NodeEvent::PeerClosed { peer }) if peer == worker => {
                progress.abandon("Worker disconnected".to_string());
                anyhow::bail!("worker disconnected during download");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("node stopped"),
        }
    };

    let data = store
        .get(root)
        .await?
        .context("assembled content missing from store")?;
    let file_name = Path::new(&name)
        .file_name()
        .map_or_else(|| hex::encode(root), |n| n.to_string_lossy().into_owned());
    std::fs::create_dir_all(output)?;
    let path = output.join(file_name);
    tokio::fs::write(&path, &data).await?;
    progress.finish_with_message(format!("Saved {} ({})", path.display(), format_bytes(size)));

    handle.shutdown().await.ok();
    Ok(())
}

/// Chunk a file locally and print its layout
async fn hash_file(config: &Config, file: &Path, pieces: bool) -> anyhow::Result<()> {
    let options = config.chunk_options();
    let started = Instant::now();
    let manifest = Chunker::new(options).chunk_file(file).await?;
    let layout = manifest.layout();

    println!("File: {}", manifest.name());
    println!("Size: {}", format_bytes(layout.total_size()));
    println!(
        "Piece size: {} ({})",
        format_bytes(u64::from(layout.piece_size())),
        match options.policy {
            PieceSizePolicy::Fixed(_) => "fixed",
            PieceSizePolicy::Graduated => "graduated",
        }
    );
    println!("Pieces: {}", layout.piece_count());
    println!("Tree layers: {}", manifest.tree().layer_count());
    println!("Root: {}", hex::encode(manifest.root()));
    if pieces {
        for (index, hash) in manifest.piece_hashes().iter().enumerate() {
            println!("  {index:>6}  {}", hex::encode(hash));
        }
    }
    tracing::debug!(elapsed = ?started.elapsed(), "hashed");
    if started.elapsed() > Duration::from_secs(1) {
        println!("Hashed in {}", format_duration(started.elapsed()));
    }
    Ok(())
}
