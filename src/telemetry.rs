use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::{get, IntoMakeService};
use axum::Router;
use hyper::server::conn::AddrIncoming;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ServiceConfig;

/// Installs the global subscriber, filtered by `RUST_LOG`
pub fn init_tracing(config: &ServiceConfig) -> eyre::Result<()> {
    let registry =
        tracing_subscriber::registry().with(EnvFilter::from_default_env());

    if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().compact())
            .try_init()?;
    }

    Ok(())
}

/// Installs the global Prometheus recorder and serves it on
/// `service.metrics_host`. Without a host nothing is installed and the
/// counters are no-ops.
pub async fn init_metrics(
    config: &ServiceConfig,
) -> eyre::Result<Option<SocketAddr>> {
    let Some(host) = config.metrics_host else {
        return Ok(None);
    };

    let handle = PrometheusBuilder::new().install_recorder()?;
    let server = spawn_metrics_server(handle, &host)?;
    let local_addr = server.local_addr();

    tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(error = %err, "Metrics server failed");
        }
    });

    tracing::info!(%local_addr, "Serving metrics");

    Ok(Some(local_addr))
}

pub fn spawn_metrics_server(
    handle: PrometheusHandle,
    host: &SocketAddr,
) -> eyre::Result<axum::Server<AddrIncoming, IntoMakeService<Router>>> {
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(handle);

    let server = axum::Server::try_bind(host)?.serve(app.into_make_service());

    Ok(server)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
