#![forbid(unsafe_code)]

//! **koi-cli** – command-line interface for a KOI processor node.
//!
//! Wraps [`koi_runtime::Runtime`] for one-shot operator use: ingest a
//! file, resolve an artifact, walk a provenance chain, print a report
//! on an RID's current state, or sit in the foreground and print FUN
//! events as they are published.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use koi_identity::{Cid, Rid};
use koi_runtime::{IngestRequest, Runtime, RuntimeConfig, StorageConfig};
use koi_store_core::ArtifactRef;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "koi")]
#[command(about = "KOI processor node - ingest, resolve and trace knowledge artifacts")]
#[command(version)]
struct Cli {
    /// Storage backend to use (memory, sqlite)
    #[arg(long, default_value = "sqlite")]
    storage: String,

    /// Data directory for persistent storage and the receipt ledger
    #[arg(long, default_value = "data")]
    data_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a file under a source RID and original identifier
    Ingest {
        /// Source RID this content was fetched from, e.g. orn:regen.raw:notion
        #[arg(long)]
        source_rid: String,
        /// Identifier for this document within the source
        #[arg(long)]
        original_id: String,
        /// Path to the file to ingest
        #[arg(long)]
        file: PathBuf,
        /// Content format hint, e.g. text/plain, text/html
        #[arg(long, default_value = "text/plain")]
        format: String,
    },
    /// Resolve an RID or CID to its artifact record
    Resolve {
        /// An orn:... RID or cid:sha256:... CID
        reference: String,
    },
    /// Walk the transformation chain that produced a CID
    Provenance {
        /// A cid:sha256:... content identifier
        cid: String,
    },
    /// Print the current artifact, history and recognized entities for an RID
    Report {
        /// An orn:... RID
        rid: String,
    },
    /// Stay in the foreground printing FUN events as they are published
    Serve {
        /// RID-glob subscription pattern, '*' matches everything
        #[arg(long, default_value = "*")]
        pattern: String,
        /// Maximum unacked events outstanding before the subscription blocks
        #[arg(long, default_value_t = 64)]
        max_unacked: usize,
    },
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("Starting koi CLI v{}", env!("CARGO_PKG_VERSION"));

    let storage = parse_storage_config(&cli.storage, &cli.data_dir)?;
    let runtime_config = RuntimeConfig {
        storage,
        bus_capacity: 1024,
        max_in_flight: 8,
        daily_budgets: Default::default(),
        dedup_thresholds: Default::default(),
        gateway: Some(koi_model_gateway::GatewayConfig::from_env()),
        pipeline: Default::default(),
    };

    let runtime = Arc::new(Runtime::new(runtime_config).await.context("failed to initialize runtime")?);
    info!("KOI runtime initialized");

    match cli.command {
        Commands::Ingest { source_rid, original_id, file, format } => {
            handle_ingest(&runtime, source_rid, original_id, file, format).await?;
        }
        Commands::Resolve { reference } => {
            handle_resolve(&runtime, reference).await?;
        }
        Commands::Provenance { cid } => {
            handle_provenance(&runtime, cid).await?;
        }
        Commands::Report { rid } => {
            handle_report(&runtime, rid).await?;
        }
        Commands::Serve { pattern, max_unacked } => {
            handle_serve(&runtime, pattern, max_unacked).await?;
        }
    }

    Ok(())
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn handle_ingest(
    runtime: &Runtime,
    source_rid: String,
    original_id: String,
    file: PathBuf,
    format: String,
) -> Result<()> {
    let source_rid = Rid::parse(&source_rid).with_context(|| format!("invalid source RID: {source_rid}"))?;
    let raw_bytes = std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;

    let outcome = runtime
        .ingest(IngestRequest { source_rid, original_id, raw_bytes, format })
        .await?;

    println!("rid: {}", outcome.rid);
    println!("markdown_cid: {}", outcome.markdown_cid);
    println!("status: {:?}", outcome.status);
    println!("chunks: {}", outcome.chunks.len());
    for chunk in &outcome.chunks {
        println!("  - {} ({})", chunk.rid, chunk.cid);
    }

    Ok(())
}

async fn handle_resolve(runtime: &Runtime, reference: String) -> Result<()> {
    let artifact_ref = if reference.starts_with("cid:") {
        ArtifactRef::Cid(Cid::parse(&reference).with_context(|| format!("invalid CID: {reference}"))?)
    } else {
        ArtifactRef::Rid(Rid::parse(&reference).with_context(|| format!("invalid RID: {reference}"))?)
    };

    match runtime.query().get_artifact(&artifact_ref).await? {
        Some(artifact) => println!("{}", serde_json::to_string_pretty(&artifact)?),
        None => println!("no artifact found for {reference}"),
    }

    Ok(())
}

async fn handle_provenance(runtime: &Runtime, cid: String) -> Result<()> {
    let cid = Cid::parse(&cid).with_context(|| format!("invalid CID: {cid}"))?;
    let chain = runtime.provenance(&cid).await?;

    if chain.is_empty() {
        println!("no receipts found for {cid}");
        return Ok(());
    }

    for receipt in &chain {
        println!(
            "{} | {} -> {} | {}",
            receipt.operation, receipt.input_cid, receipt.output_cid, receipt.created_at
        );
    }

    Ok(())
}

async fn handle_report(runtime: &Runtime, rid: String) -> Result<()> {
    let rid = Rid::parse(&rid).with_context(|| format!("invalid RID: {rid}"))?;

    let artifact = runtime.query().get_artifact(&ArtifactRef::Rid(rid.clone())).await?;
    let history = runtime.store().history(&rid).await?;
    let entities = runtime.query().entities_of(&rid).await;

    println!("rid: {rid}");
    match &artifact {
        Some(artifact) => println!("current cid: {} ({})", artifact.cid, artifact.stage),
        None => println!("current cid: none"),
    }
    println!("revisions: {}", history.len());
    for revision in &history {
        println!("  - {} (from {})", revision.cid, revision.valid_from);
    }
    println!("entities: {}", entities.len());
    for entity in &entities {
        println!("  - {} ({})", entity.surface_form, entity.entity_kind);
    }

    Ok(())
}

async fn handle_serve(runtime: &Runtime, pattern: String, max_unacked: usize) -> Result<()> {
    println!("listening for FUN events matching '{pattern}' (Ctrl+C to stop)");

    let mut subscription = runtime.bus().subscribe(pattern, max_unacked);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = subscription.recv() => {
                match result {
                    Ok(event) => {
                        println!("{:?} {} seq={}", event.kind, event.rid, event.seq);
                        subscription.ack(event.seq).await.ok();
                    }
                    Err(e) => {
                        tracing::error!("subscription error: {}", e);
                        break;
                    }
                }
            }
            _ = &mut ctrl_c => {
                println!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn parse_storage_config(storage_type: &str, data_dir: &str) -> Result<StorageConfig> {
    match storage_type.to_lowercase().as_str() {
        "memory" => Ok(StorageConfig::Memory { ledger_dir: PathBuf::from(data_dir) }),
        "sqlite" => Ok(StorageConfig::Sqlite { data_dir: PathBuf::from(data_dir) }),
        other => Err(anyhow::anyhow!("unsupported storage type: {other}. supported: memory, sqlite")),
    }
}
