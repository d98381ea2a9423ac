//! Downstream-facing server assembly.
//!
//! The hub serves the same router over streamable HTTP (the primary
//! surface) or newline-delimited JSON-RPC on stdio.

pub mod http;
pub mod session;
pub mod stdio;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::hub::Hub;

/// Server front for one hub.
pub struct HubServer {
    hub: Arc<Hub>,
}

impl HubServer {
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Run the streamable HTTP listener until ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns error when the listener cannot bind or the server fails.
    pub async fn run_http(self, host: &str, port: u16) -> anyhow::Result<()> {
        self.hub.start().await;

        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {host}:{port}: {e}"))?;
        let router = http::create_router(self.hub.clone());

        tracing::info!("hub listening on http://{addr}/mcp");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.hub.stop().await;
        tracing::info!("hub shut down");
        Ok(())
    }

    /// Run over stdin/stdout until EOF.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure.
    pub async fn run_stdio(self) -> anyhow::Result<()> {
        self.hub.start().await;
        let result = stdio::run_stdio(self.hub.clone()).await;
        self.hub.stop().await;
        result
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
    tracing::info!("received shutdown signal");
}
