use std::net::SocketAddr;

use l8r_common::{Error, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::SharedState;

/// Binds the configured address and serves the gateway until ctrl-c.
pub struct GatewayServer {
    state: SharedState,
}

impl GatewayServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub fn bind_address(&self) -> String {
        let gateway = &self.state.config.gateway;
        format!("{}:{}", gateway.host, gateway.port)
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        if let Some(addr) = local {
            info!("l8r gateway listening on http://{addr}");
        }

        let app = build_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!("cannot listen for ctrl-c, running until killed: {e}");
            std::future::pending::<()>().await;
        }
    }
}
