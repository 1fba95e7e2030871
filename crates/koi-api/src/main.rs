#![forbid(unsafe_code)]

//! **koi-api** – HTTP and SSE surface for a KOI processor node.
//!
//! Wraps a [`koi_runtime::Runtime`] behind a small axum [`Router`]:
//! ingest documents, resolve artifacts, walk provenance chains, search
//! the vector index, and subscribe to the FUN event bus over
//! server-sent events, acking delivered events back via
//! `POST /subscribe/{id}/ack`.
//!
//! ## Usage
//!
//! ```bash
//! koi-api --data-dir data --port 8080
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap_like::Cli;
use futures::stream::Stream;
use koi_identity::{Cid, Rid};
use koi_ledger::Receipt;
use koi_pipeline::{IngestStatus, PipelineError};
use koi_query::SearchHit;
use koi_runtime::{IngestRequest, Runtime, RuntimeConfig, StorageConfig};
use koi_scheduler::SchedulerError;
use koi_store_core::{Artifact, ArtifactRef};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::Mutex as AsyncMutex;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Minimal hand-rolled argument parsing so this binary does not need a
/// CLI-parsing dependency of its own; `koi-cli`'s `serve` subcommand is
/// the primary way this service gets started in practice.
mod clap_like {
    pub struct Cli {
        pub data_dir: std::path::PathBuf,
        pub port: u16,
        pub log_level: String,
    }

    impl Cli {
        pub fn parse() -> Self {
            let mut data_dir = std::path::PathBuf::from("data");
            let mut port: u16 = 8080;
            let mut log_level = "info".to_string();
            let mut args = std::env::args().skip(1);
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--data-dir" => {
                        if let Some(v) = args.next() {
                            data_dir = std::path::PathBuf::from(v);
                        }
                    }
                    "--port" => {
                        if let Some(v) = args.next() {
                            port = v.parse().unwrap_or(port);
                        }
                    }
                    "--log-level" => {
                        if let Some(v) = args.next() {
                            log_level = v;
                        }
                    }
                    _ => {}
                }
            }
            Self { data_dir, port, log_level }
        }
    }
}

//─────────────────────────────
//  Service state
//─────────────────────────────

/// A subscription shared between the handler that hands out its id and
/// the SSE stream task that owns its `recv`/`ack` calls.
type SharedSubscription = Arc<AsyncMutex<koi_bus::Subscription>>;
/// Live SSE subscriptions keyed by the id handed to `GET /subscribe`
/// callers, so a later `POST /subscribe/{id}/ack` can reach the same
/// subscription to acknowledge delivered events.
type SubscriptionRegistry = Arc<AsyncMutex<HashMap<String, SharedSubscription>>>;

#[derive(Clone)]
struct ServiceState {
    runtime: Arc<Runtime>,
    subscriptions: SubscriptionRegistry,
}

//─────────────────────────────
//  API types
//─────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    source_rid: String,
    original_id: String,
    content: String,
    format: String,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    rid: String,
    #[serde(rename = "cid")]
    markdown_cid: String,
    status: IngestStatus,
    chunk_count: usize,
}

#[derive(Debug, Serialize)]
struct ArtifactResponse {
    artifact: Artifact,
}

#[derive(Debug, Serialize)]
struct ProvenanceResponse {
    chain: Vec<Receipt>,
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    embedding: Vec<f32>,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    pattern: String,
    #[serde(default = "default_max_unacked")]
    max_unacked: usize,
}

fn default_max_unacked() -> usize {
    64
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    seq: u64,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Runtime(#[from] koi_runtime::RuntimeError),
    #[error(transparent)]
    Storage(#[from] koi_store_core::StorageError),
    #[error(transparent)]
    Ledger(#[from] koi_ledger::LedgerError),
    #[error(transparent)]
    Bus(#[from] koi_bus::BusError),
    #[error("not found")]
    NotFound,
    #[error("invalid identifier: {0}")]
    BadIdentifier(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadIdentifier(_) => StatusCode::BAD_REQUEST,
            ApiError::Bus(koi_bus::BusError::UnknownSeq(_)) => StatusCode::BAD_REQUEST,
            ApiError::Runtime(koi_runtime::RuntimeError::InvalidIdentifier(_)) => StatusCode::BAD_REQUEST,
            ApiError::Runtime(koi_runtime::RuntimeError::Pipeline(PipelineError::EmptyDocument)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Runtime(koi_runtime::RuntimeError::Pipeline(PipelineError::Scheduler(
                SchedulerError::BudgetExceeded { .. },
            ))) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Runtime(koi_runtime::RuntimeError::Pipeline(PipelineError::Cancelled)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Storage(koi_store_core::StorageError::BackendUnavailable(_))
            | ApiError::Runtime(koi_runtime::RuntimeError::Storage(koi_store_core::StorageError::BackendUnavailable(
                _,
            )))
            | ApiError::Ledger(koi_ledger::LedgerError::BackendUnavailable(_))
            | ApiError::Runtime(koi_runtime::RuntimeError::Ledger(koi_ledger::LedgerError::BackendUnavailable(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("Starting koi-api v{}", env!("CARGO_PKG_VERSION"));

    let runtime_config = RuntimeConfig {
        storage: StorageConfig::Sqlite { data_dir: cli.data_dir.clone() },
        bus_capacity: 1024,
        max_in_flight: 8,
        daily_budgets: Default::default(),
        dedup_thresholds: Default::default(),
        gateway: koi_model_gateway_config(),
        pipeline: Default::default(),
    };

    let runtime = Arc::new(
        Runtime::new(runtime_config)
            .await
            .context("failed to initialize runtime")?,
    );
    info!("KOI runtime initialized over {}", cli.data_dir.display());

    let state = ServiceState {
        runtime,
        subscriptions: Arc::new(AsyncMutex::new(HashMap::new())),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("HTTP server listening on port {}", cli.port);

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("koi-api stopped");
    Ok(())
}

fn koi_model_gateway_config() -> Option<koi_model_gateway::GatewayConfig> {
    Some(koi_model_gateway::GatewayConfig::from_env())
}

//─────────────────────────────
//  HTTP application
//─────────────────────────────

fn create_app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/process", post(process_document))
        .route("/artifact/:reference", get(get_artifact))
        .route("/provenance/:cid", get(get_provenance))
        .route("/search", post(search))
        .route("/subscribe", get(subscribe))
        .route("/subscribe/:id/ack", post(ack_subscription))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn process_document(
    State(state): State<ServiceState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let source_rid: Rid = request
        .source_rid
        .parse()
        .map_err(|_| ApiError::BadIdentifier(request.source_rid.clone()))?;

    let outcome = state
        .runtime
        .ingest(IngestRequest {
            source_rid,
            original_id: request.original_id,
            raw_bytes: request.content.into_bytes(),
            format: request.format,
        })
        .await?;

    Ok(Json(ProcessResponse {
        rid: outcome.rid.to_string(),
        markdown_cid: outcome.markdown_cid.to_string(),
        status: outcome.status,
        chunk_count: outcome.chunks.len(),
    }))
}

async fn get_artifact(
    State(state): State<ServiceState>,
    AxumPath(reference): AxumPath<String>,
) -> Result<Json<ArtifactResponse>, ApiError> {
    let artifact_ref = parse_artifact_ref(&reference)?;
    let artifact = state
        .runtime
        .query()
        .get_artifact(&artifact_ref)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(ArtifactResponse { artifact }))
}

async fn get_provenance(
    State(state): State<ServiceState>,
    AxumPath(cid): AxumPath<String>,
) -> Result<Json<ProvenanceResponse>, ApiError> {
    let cid = Cid::parse(&cid).map_err(|e| ApiError::BadIdentifier(e.to_string()))?;
    let chain = state.runtime.provenance(&cid).await?;
    Ok(Json(ProvenanceResponse { chain }))
}

async fn search(
    State(state): State<ServiceState>,
    Json(request): Json<SearchRequest>,
) -> Json<SearchResponse> {
    let hits = state.runtime.query().search(&request.embedding, request.top_k).await;
    Json(SearchResponse { hits })
}

fn parse_artifact_ref(reference: &str) -> Result<ArtifactRef, ApiError> {
    if reference.starts_with("cid:") {
        Cid::parse(reference)
            .map(ArtifactRef::Cid)
            .map_err(|e| ApiError::BadIdentifier(e.to_string()))
    } else {
        reference
            .parse::<Rid>()
            .map(ArtifactRef::Rid)
            .map_err(|_| ApiError::BadIdentifier(reference.to_string()))
    }
}

async fn subscribe(
    State(state): State<ServiceState>,
    Query(query): Query<SubscribeQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.runtime.bus().subscribe(query.pattern, query.max_unacked);
    let id = Uuid::new_v4().to_string();
    let shared: SharedSubscription = Arc::new(AsyncMutex::new(subscription));
    state.subscriptions.lock().await.insert(id.clone(), shared.clone());

    // Delivered events stay unacked until the client calls
    // `POST /subscribe/{id}/ack`, so a slow or crashed consumer's
    // backpressure window closes instead of silently dropping events.
    let registry = state.subscriptions.clone();
    let stream = futures::stream::unfold(Some((id, shared, registry)), |state| async move {
        let (id, shared, registry) = state?;
        let mut subscription = shared.lock().await;
        match subscription.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                let sse_event = Event::default().event("fun").id(event.seq.to_string()).data(payload);
                drop(subscription);
                Some((Ok(sse_event), Some((id, shared, registry))))
            }
            Err(_) => {
                drop(subscription);
                registry.lock().await.remove(&id);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn ack_subscription(
    State(state): State<ServiceState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<AckRequest>,
) -> Result<StatusCode, ApiError> {
    let shared = state.subscriptions.lock().await.get(&id).cloned().ok_or(ApiError::NotFound)?;
    shared.lock().await.ack(request.seq).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn init_logging(log_level: &str) -> Result<()> {
    let log_filter = format!("koi_api={log_level},koi_runtime={log_level},koi_pipeline={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
