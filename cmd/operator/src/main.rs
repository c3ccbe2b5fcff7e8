use perm8s_k8s_util::client::new_client_with_metrics;
use perm8s_operator::controller::{
    ControllerSettings, DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS, SUBSCRIBE_BUFFER_SIZE,
    State as Perm8sState, Stores, create_subscriber,
};
use perm8s_operator::crd::{Group, SynchronisationSource, User};
use perm8s_operator::metrics::Metrics;
use perm8s_operator::telemetry::{self, METRICS_EXPORT_INTERVAL};
use perm8s_sync_source::adapter::AdapterRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{Router, get};
use clap::{Parser, crate_authors, crate_description, crate_version};
use futures::TryFutureExt;
use kube::Config;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

async fn metrics(State(state): State<Perm8sState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            error!(msg = "failed to get metrics", %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

async fn ready(State(state): State<Perm8sState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json("ready"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json("caches not synced"))
    }
}

#[derive(Parser, Debug)]
#[command(
    name="perm8s",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long, env)]
    master: Option<String>,

    /// Number of workers reconciling each resource kind
    #[arg(long, default_value_t = DEFAULT_WORKERS, env)]
    workers: usize,

    /// Seconds between two full resyncs of the cached resources
    #[arg(long, default_value_t = DEFAULT_RESYNC_PERIOD.as_secs(), env)]
    resync_period: u64,

    /// Serve `/health`, `/ready` and `/metrics`
    #[arg(long, env)]
    diagnostics: bool,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,perm8s=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,
}

async fn kube_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    if let Some(master) = &args.master {
        config.cluster_url = master
            .parse::<Uri>()
            .with_context(|| format!("invalid master url {master}"))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format)?;
    let (meter_provider, exporter, meter) = telemetry::init_metrics(METRICS_EXPORT_INTERVAL);

    let config = kube_config(&args).await?;
    let client = new_client_with_metrics(config, &meter).await?;

    let groups = create_subscriber::<Group>(SUBSCRIBE_BUFFER_SIZE);
    let (user_store, user_writer) = reflector::store::<User>();
    let (source_store, source_writer) = reflector::store::<SynchronisationSource>();
    let stores = Stores::new(groups.store, user_store, source_store);

    let controllers = [
        perm8s_group::controller::CONTROLLER_ID,
        perm8s_user::controller::CONTROLLER_ID,
        perm8s_sync_source::controller::CONTROLLER_ID,
    ];
    let state = Perm8sState::new(Metrics::new(&meter, &controllers), exporter, stores);
    let settings = ControllerSettings {
        workers: args.workers,
        resync_period: Duration::from_secs(args.resync_period.max(1)),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!(msg = "shutdown signal received, draining workers");
            shutdown.cancel();
        }
    });

    let group_c = perm8s_group::controller::run(
        state.clone(),
        client.clone(),
        groups.writer,
        settings,
        shutdown.clone(),
    )
    .err_into::<anyhow::Error>();
    let user_c = perm8s_user::controller::run(
        state.clone(),
        client.clone(),
        user_writer,
        groups.subscriber,
        settings,
        shutdown.clone(),
    )
    .err_into::<anyhow::Error>();
    let source_c = perm8s_sync_source::controller::run(
        state.clone(),
        client,
        source_writer,
        Arc::new(AdapterRegistry::default()),
        settings,
        shutdown.clone(),
    )
    .err_into::<anyhow::Error>();
    let server = serve_diagnostics(args.diagnostics, args.port, state, shutdown.clone());

    let result = tokio::try_join!(group_c, user_c, source_c, server).map(|_| ());
    if let Err(e) = meter_provider.shutdown() {
        warn!(msg = "failed to shut down meter provider", %e);
    }
    result
}

async fn serve_diagnostics(
    enabled: bool,
    port: u16,
    state: Perm8sState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if !enabled {
        return Ok(());
    }
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(msg = format!("serving diagnostics on port {port}"));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(msg = "failed to listen for CTRL+C", %e);
            futures::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(msg = "failed to listen for SIGTERM", %e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
