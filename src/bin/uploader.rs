use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use resumable_upload::engine::{ResumeWithFileRequest, StartRequest, UploadEngine};
use resumable_upload::events::{UploadEvent, UploadEventKind};
use resumable_upload::metrics::{init_metrics, start_metrics_server, MetricsConfig};
use resumable_upload::{EngineConfig, HttpTransferClient, SessionStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Resumable multipart uploads from the command line.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable multipart uploader")]
struct Args {
    /// Base URL of the upload coordination service
    #[arg(long, env = "UPLOAD_BACKEND_URL")]
    backend_url: Option<String>,

    /// Where upload sessions are persisted
    #[arg(long, env = "UPLOAD_DATABASE_URL", default_value = "sqlite://./data/uploads.db")]
    database_url: String,

    /// Bearer token for the coordination service
    #[arg(long, env = "UPLOAD_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Parts uploaded in parallel
    #[arg(long, env = "UPLOAD_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Use the low-bandwidth preset
    #[arg(long)]
    constrained: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file from scratch
    Upload {
        file: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Continue a persisted upload with its original file
    Resume {
        file: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long)]
        upload_id: String,
    },
    /// Finalize a nearly complete upload whose file is gone
    ResumeInterrupted {
        #[arg(long)]
        project: String,
    },
    /// Cancel an upload and abort it remotely
    Cancel { upload_id: String },
    /// Drop the record of a failed upload
    Acknowledge { upload_id: String },
    /// Show uploads that can be resumed
    List,
    /// Delete stale upload records
    Reap,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut config = if self.constrained {
            EngineConfig::constrained()
        } else {
            EngineConfig::default()
        };
        if let Some(n) = self.max_concurrency {
            config.max_concurrent_chunks = n;
        }
        config
    }

    fn transfer_client(&self) -> Result<HttpTransferClient> {
        let Some(base_url) = &self.backend_url else {
            bail!("--backend-url or UPLOAD_BACKEND_URL is required");
        };
        let client = match &self.api_token {
            Some(token) => HttpTransferClient::with_bearer_token(base_url.as_str(), token),
            None => HttpTransferClient::new(base_url.as_str()),
        };
        client.context("building HTTP client")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    init_metrics();
    if let Some(listen_addr) = args.metrics_addr {
        start_metrics_server(MetricsConfig { listen_addr }).context("starting metrics exporter")?;
        tracing::info!(%listen_addr, "metrics exporter listening");
    }

    ensure_database_dir(&args.database_url)?;
    let store = SessionStore::new(&args.database_url)
        .await
        .with_context(|| format!("opening session store at {}", args.database_url))?;
    let store = Arc::new(store);
    let client = Arc::new(args.transfer_client()?);
    let engine = UploadEngine::new(client, store.clone(), args.engine_config())?;

    let result = run(&engine, args.command).await;
    engine.shutdown().await;
    store.close().await;
    result
}

async fn run(engine: &UploadEngine, command: Command) -> Result<()> {
    match command {
        Command::Upload {
            file,
            project,
            destination,
            mime_type,
        } => {
            let events = engine.subscribe();
            let mut request = StartRequest::new(file, project);
            request.destination = destination;
            request.mime_type = mime_type;
            let upload_id = engine.start(request).await?;
            println!("upload id: {upload_id}");
            follow(engine, events, &upload_id).await
        }
        Command::Resume {
            file,
            project,
            upload_id,
        } => {
            let events = engine.subscribe();
            engine
                .resume_with_file(ResumeWithFileRequest::new(file, project, &upload_id))
                .await?;
            follow(engine, events, &upload_id).await
        }
        Command::ResumeInterrupted { project } => {
            let final_key = engine.resume_interrupted(&project).await?;
            println!("completed: {final_key}");
            Ok(())
        }
        Command::Cancel { upload_id } => {
            engine.cancel(&upload_id).await?;
            println!("cancelled {upload_id}");
            Ok(())
        }
        Command::Acknowledge { upload_id } => {
            if engine.acknowledge(&upload_id).await? {
                println!("dropped {upload_id}");
            } else {
                println!("no record for {upload_id}");
            }
            Ok(())
        }
        Command::List => {
            let sessions = engine.list_active_uploads().await?;
            if sessions.is_empty() {
                println!("no resumable uploads");
            }
            for s in sessions {
                println!(
                    "{}  {:<9} {:>3}%  {}  {}  (last activity {})",
                    s.upload_id,
                    s.status,
                    s.progress,
                    s.project_id,
                    s.file_name,
                    s.last_activity.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Reap => {
            let reaped = engine.reap_stale().await?;
            println!("reaped {reaped} stale sessions");
            Ok(())
        }
    }
}

/// Print events for `upload_id` until it ends. Ctrl-C pauses the upload so
/// it can be resumed later.
async fn follow(
    engine: &UploadEngine,
    mut events: broadcast::Receiver<UploadEvent>,
    upload_id: &str,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.pause(upload_id).await?;
                println!("paused; continue with `resume --upload-id {upload_id}`");
                return Ok(());
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
                };
                if event.upload_id != upload_id {
                    continue;
                }
                match &event.kind {
                    UploadEventKind::Progress => {
                        println!("{:>3}%  {}", event.progress, event.step);
                    }
                    UploadEventKind::Complete { final_key } => {
                        println!("completed: {final_key}");
                        return Ok(());
                    }
                    UploadEventKind::Paused => println!("paused"),
                    UploadEventKind::Cancelled => {
                        println!("cancelled");
                        return Ok(());
                    }
                    UploadEventKind::Error { message, retryable } => {
                        if *retryable {
                            bail!("upload failed: {message} (starting a new upload may succeed)");
                        }
                        bail!("upload failed: {message}");
                    }
                }
            }
        }
    }
}

fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}
