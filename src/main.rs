//! Volume Orchestrator
//!
//! Block storage control plane: schedules volumes onto capability-reporting
//! backends and drives every lifecycle request through a crash-safe flow.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_orchestrator::{
    ApiServer, ApiServerConfig, DriverSet, Error, EventBus, MemoryStore, Orchestrator,
    OrchestratorConfig, OrchestratorMetrics, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Orchestrator - backend scheduling and volume task flows
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// YAML configuration file (backend fleet and tuning)
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Backend poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "30")]
    poll_interval_secs: u64,

    /// Interval between passes over stalled flows, in seconds
    #[arg(long, env = "RESUME_INTERVAL", default_value = "15")]
    resume_interval_secs: u64,

    /// Override the report staleness threshold, in seconds
    #[arg(long, env = "STALENESS_SECS")]
    staleness_secs: Option<u64>,

    /// Override the volume lock lease, in seconds
    #[arg(long, env = "LEASE_SECS")]
    lease_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!(
        version = volume_orchestrator::VERSION,
        api = %args.api_addr,
        "Starting Volume Orchestrator"
    );

    let config = load_config(&args)?;
    if config.backends.is_empty() {
        warn!("No backends configured, every create will fail scheduling");
    }

    let drivers = DriverSet::from_specs(&config.backends)?;
    let events = EventBus::new(config.event_capacity);
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(config, store, drivers, events.clone())?;

    orchestrator.initialize().await?;

    let shutdown = CancellationToken::new();
    let mut tasks = orchestrator.spawn_maintenance(
        Duration::from_secs(args.poll_interval_secs),
        Duration::from_secs(args.resume_interval_secs),
        shutdown.clone(),
    );
    tasks.push(spawn_event_log(&events, shutdown.clone()));

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    let health_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_orchestrator).await {
            error!(error = %e, "Health server error");
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let metrics = orchestrator.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: parse_addr(&args.api_addr, "REST API")?,
            ..Default::default()
        },
        orchestrator.clone(),
    ));
    let server = {
        let api_server = api_server.clone();
        tokio::spawn(async move { api_server.run().await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");

    shutdown.cancel();
    api_server.shutdown();
    match server.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "REST server task failed"),
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            OrchestratorConfig::load(path)?
        }
        None => OrchestratorConfig::default(),
    };

    if let Some(secs) = args.staleness_secs {
        config.registry.staleness_threshold = Duration::from_secs(secs);
    }
    if let Some(secs) = args.lease_secs {
        config.locking.default_lease = Duration::from_secs(secs);
    }

    config.validate()?;
    Ok(config)
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
}

/// Log every terminal request event
fn spawn_event_log(events: &EventBus, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => info!(
                        request_id = %event.request_id,
                        volume_id = event.volume_id.as_deref().unwrap_or("-"),
                        operation = %event.operation,
                        success = event.is_success(),
                        "Request finished"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, orchestrator: Arc<Orchestrator>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain(StatusCode::OK, "ok"),
                        "/readyz" if orchestrator.registry().stats().fresh_backends > 0 => {
                            plain(StatusCode::OK, "ok")
                        }
                        "/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, "no fresh backends"),
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!(%addr, "Health server listening");
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<OrchestratorMetrics>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode_text() {
                            Ok(text) => {
                                let mut response = plain(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    hyper::header::CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!(%addr, "Metrics server listening");
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
