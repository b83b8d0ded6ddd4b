use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracer::Tracer;
use tracing::{info, warn};

use crate::{
    acceptor,
    client::ClientConfig,
    hub::{Hub, HubConfig, HubHandle},
};

/// One room served over HTTP: a hub plus the acceptor in front of it.
pub struct Server {
    listener: TcpListener,
    hub: Hub,
    handle: HubHandle,
    client_config: ClientConfig,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        hub_config: HubConfig,
        client_config: ClientConfig,
        tracer: Box<dyn Tracer>,
    ) -> Self {
        let (hub, handle) = Hub::new(hub_config, tracer);
        Self {
            listener,
            hub,
            handle,
            client_config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the room's hub, usable before and while the server runs.
    pub fn hub(&self) -> HubHandle {
        self.handle.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            handle,
            client_config,
        } = self;

        tokio::spawn(hub.run());

        let app = acceptor::router(handle, client_config);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")?;

        info!("server shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
