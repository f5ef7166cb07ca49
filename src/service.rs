use std::net::SocketAddr;
use std::sync::Arc;

use eyre::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::keys::{BackendFactory, DefaultBackendFactory};
use crate::metadata::MetadataStore;
use crate::registry::SignerRegistry;
use crate::router::RequestRouter;
use crate::upstream::{HttpUpstream, Upstream};

pub struct Service {
    router: Arc<RequestRouter>,
    local_addr: SocketAddr,
    server_handle: JoinHandle<Result<(), hyper::Error>>,
}

impl Service {
    pub async fn new(config: Config) -> eyre::Result<Self> {
        Self::with_backend_factory(config, Arc::new(DefaultBackendFactory))
            .await
    }

    pub async fn with_backend_factory(
        config: Config,
        factory: Arc<dyn BackendFactory>,
    ) -> eyre::Result<Self> {
        let store = MetadataStore::new(&config.signing.directory);
        let registry = SignerRegistry::load(store, factory)
            .await
            .context("Failed to load signing identities")?;

        let upstream: Arc<dyn Upstream> =
            Arc::new(HttpUpstream::from_config(&config.upstream)?);

        let router = Arc::new(RequestRouter::new(
            Arc::new(registry),
            upstream,
            config.signing.router_config(),
        ));

        let server =
            crate::server::spawn_server(router.clone(), &config.server.host)
                .await?;
        let local_addr = server.local_addr();
        let server_handle = tokio::spawn(async move {
            server.await?;
            Ok(())
        });

        tracing::info!(%local_addr, upstream = %config.upstream.url, "Serving");

        Ok(Self {
            router,
            local_addr,
            server_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Rescans the metadata directory on every SIGHUP
    pub fn spawn_reload_task(&self) -> eyre::Result<JoinHandle<()>> {
        let mut sighup = signal(SignalKind::hangup())?;
        let registry = self.router.registry().clone();

        Ok(tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                tracing::info!("SIGHUP received, reloading signing identities");

                if let Err(err) = registry.reload().await {
                    tracing::error!(
                        error = ?err,
                        "Reload failed, keeping current identities"
                    );
                }
            }
        }))
    }

    pub async fn wait(self) -> eyre::Result<()> {
        self.server_handle.await??;

        Ok(())
    }
}
