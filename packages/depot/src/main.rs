use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use depot::pipeline::UploadRequest;
use depot::{Config, Depot};

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Content-addressed file storage gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config.toml (defaults to ~/.config/depot/config.toml)
    #[arg(long, global = true, env = "DEPOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway and the background reclaimer
    Serve {
        /// Address to listen on, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Store a file and print its record
    Put {
        /// Path to the file to store
        file: PathBuf,

        /// Identity to store the file under
        #[arg(long)]
        id: Option<Uuid>,

        /// Filename to record (defaults to the file's name)
        #[arg(long)]
        name: Option<String>,

        /// Declared content type
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Write a file's content to disk or stdout
    Get {
        id: Uuid,

        /// Output path (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a file's record in any state
    Info { id: Uuid },

    /// Print a time-limited download URL signed by the backend
    Url {
        id: Uuid,

        /// Lifetime in seconds (defaults to server.presign_expiry_secs)
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// List active files, newest first
    List {
        #[arg(long, default_value_t = 50)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Delete a file; content is reclaimed after the grace period
    Delete { id: Uuid },

    /// Undo a delete before the content is reclaimed
    Restore { id: Uuid },

    /// Reclaim unreferenced objects
    Gc {
        /// Dry run - don't actually delete anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().await.context("Failed to load config")?,
    };

    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.server.bind = bind.clone();
    }

    let depot = Depot::open(config).await.context("Failed to open depot")?;

    match cli.command {
        Commands::Serve { .. } => {
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Shutting down");
                    }
                    shutdown.cancel();
                }
            });
            depot.serve(shutdown).await?;
        }
        Commands::Put {
            file,
            id,
            name,
            content_type,
        } => {
            tracing::info!("Storing file: {}", file.display());
            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;

            let filename =
                name.or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()));
            let request = UploadRequest {
                id,
                filename,
                declared_content_type: content_type,
            };

            let outcome = depot
                .pipeline
                .upload(request, ReaderStream::with_capacity(handle, 64 * 1024))
                .await?;
            if outcome.deduplicated {
                tracing::info!(ref_count = outcome.ref_count, "Content already stored");
            }
            print_json(&outcome.record)?;
        }
        Commands::Get { id, output } => {
            let (record, mut stream) = depot.files.get(id).await?;

            let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Failed to create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };

            while let Some(chunk) = stream.next().await {
                writer.write_all(&chunk?).await?;
            }
            writer.flush().await?;

            if let Some(path) = output {
                tracing::info!(bytes = record.size, "Wrote {}", path.display());
            }
        }
        Commands::Info { id } => print_json(&depot.files.describe(id).await?)?,
        Commands::Url { id, expires_in } => {
            let expires_in = depot.config.server.clamp_presign_expiry(expires_in);
            print_json(&depot.files.presign(id, expires_in).await?)?
        }
        Commands::List { limit, offset } => {
            print_json(&depot.files.list(Some(limit), Some(offset)).await?)?
        }
        Commands::Delete { id } => {
            let record = depot.files.delete(id).await?;
            println!("Deleted {}", record.id);
        }
        Commands::Restore { id } => print_json(&depot.files.restore(id).await?)?,
        Commands::Gc { dry_run } => {
            tracing::info!("Running garbage collection (dry_run: {})", dry_run);
            let report = depot.reclaimer.run_once(dry_run).await?;
            print_json(&report)?;
            print_json(&depot.db.stats().await?)?;
        }
    }

    Ok(())
}
