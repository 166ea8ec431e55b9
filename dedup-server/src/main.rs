use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dedup_server::check::{check_integrity, CheckConfig};
use dedup_server::config::{canonical_root, ServerArgs, ServerConfig, StoreArgs};
use dedup_server::http_api::ApiService;
use dedup_server::inspect::format_bytes;
use dedup_server::metrics::SharedMetrics;
use dedup_server::retrieve::{retrieve, RetrieveConfig};
use dedup_storage::DedupStore;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect a store offline
    Inspect {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: InspectCommand,
    },

    /// Copy a file's content to disk
    Retrieve(RetrieveConfig),

    /// Check reference counts and blobs
    Check(CheckConfig),

    /// Start the HTTP server
    Server(ServerArgs),
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    /// Storage savings, globally or for one owner
    Stats {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Groups of files sharing one payload
    Duplicates {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Files of one owner
    ListFiles {
        #[arg(long)]
        owner: String,
    },
    /// Per-owner storage and activity
    Owners,
    /// Number of keys per metadata tree
    NumKeys,
    /// Disk space used by metadata and blobs
    DiskSpace,
    /// Show detailed information about a specific file
    FileInfo {
        /// File id
        id: String,
    },
}

fn setup_tracing(log_level: &str) {
    // RUST_LOG wins over the flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { store, command } => {
            setup_tracing("warn");
            inspect(store, command)?;
        }
        Command::Retrieve(config) => {
            setup_tracing("info");
            retrieve(config)?;
        }
        Command::Check(config) => {
            setup_tracing("info");
            check_integrity(config)?;
        }
        Command::Server(args) => {
            let config = ServerConfig::from_args(args)?;
            setup_tracing(&config.log_level);
            run(config)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn inspect(args: StoreArgs, command: InspectCommand) -> Result<()> {
    use dedup_server::inspect::*;

    let store = args.open()?;
    match command {
        InspectCommand::Stats { owner } => stats(&store, owner)?,
        InspectCommand::Duplicates { owner } => duplicates(&store, owner)?,
        InspectCommand::ListFiles { owner } => list_files(&store, owner)?,
        InspectCommand::Owners => owners(&store)?,
        InspectCommand::NumKeys => {
            for (tree, keys) in num_keys(&store)? {
                println!("{tree:<16} {keys}");
            }
        }
        InspectCommand::DiskSpace => {
            let (meta, blobs) = disk_space(&store).await?;
            println!("Metadata: {} ({meta} bytes)", format_bytes(meta));
            println!("Blobs: {} ({blobs} bytes)", format_bytes(blobs));
        }
        InspectCommand::FileInfo { id } => file_info(&store, &id)?,
    }
    Ok(())
}

#[tokio::main]
async fn run(mut config: ServerConfig) -> Result<()> {
    // Absolute roots keep relative paths from hitting getcwd on every blob access
    config.fs_root = canonical_root(&config.fs_root)?;
    config.meta_root = canonical_root(&config.meta_root)?;

    info!("Using fs_root: {}", config.fs_root.display());
    info!("Using meta_root: {}", config.meta_root.display());

    let metrics = SharedMetrics::new();
    let store = DedupStore::open(&config.store_config(), metrics.to_storage_metrics())?;
    let cleared = store.clear_staging().await?;
    if cleared > 0 {
        warn!(cleared, "removed staged uploads left by a previous run");
    }
    if let Some(limit) = config.max_upload_size {
        info!("Upload limit: {}", format_bytes(limit));
    }

    let store = Arc::new(store);
    let service = ApiService::new(Arc::clone(&store), metrics.clone());

    // Periodically refresh the unique blob gauge
    {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                match store.refs().len() {
                    Ok(count) => metrics.set_unique_blobs(count),
                    Err(err) => warn!("failed to count reference entries: {err}"),
                }
            }
        });
    }

    run_server(&config, service).await?;

    store.persist()?;
    info!("server is stopped");
    Ok(())
}

async fn run_server(config: &ServerConfig, service: ApiService) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let metrics_listener =
        tokio::net::TcpListener::bind((config.metric_host.as_str(), config.metric_port)).await?;
    let metrics_addr = metrics_listener.local_addr()?;

    info!("metrics server is running at http://{metrics_addr}");

    let metrics_service = hyper::service::service_fn(
        move |req: hyper::Request<hyper::body::Incoming>| async move {
            match (req.method(), req.uri().path()) {
                (&hyper::Method::GET, "/metrics") => match dedup_server::metrics::render() {
                    Ok(buffer) => hyper::Response::builder()
                        .status(200)
                        .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                        .body(Full::new(Bytes::from(buffer))),
                    Err(err) => hyper::Response::builder()
                        .status(500)
                        .body(Full::new(Bytes::from(err.to_string()))),
                },
                _ => hyper::Response::builder()
                    .status(404)
                    .body(Full::new(Bytes::from("Not Found"))),
            }
        },
    );

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    info!("server is running at http://{local_addr}");

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let service = service.clone();
                        let handler = hyper::service::service_fn(
                            move |req: hyper::Request<hyper::body::Incoming>| {
                                let service = service.clone();
                                async move { service.handle_request(req).await }
                            },
                        );
                        let conn = http_server.serve_connection(TokioIo::new(socket), handler);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                    }
                    Err(err) => {
                        tracing::error!("error accepting connection: {err}");
                    }
                }
            }
            res = metrics_listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let conn = http_server.serve_connection(TokioIo::new(socket), metrics_service);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                    }
                    Err(err) => {
                        tracing::error!("error accepting metrics connection: {err}");
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                break;
            }
        };
    }

    tokio::select! {
        () = graceful.shutdown() => {
            tracing::debug!("Gracefully shutdown!");
        },
        () = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
            tracing::debug!("Waited 10 seconds for graceful shutdown, aborting...");
        }
    }

    Ok(())
}
