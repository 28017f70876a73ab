use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{Nimbus, NimbusResult};

use super::{create_router, spawn_rate_limit_pruner, ServerState, RATE_LIMIT_PRUNE_INTERVAL};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Serves the REST API on the configured address until `shutdown` is cancelled.
pub async fn serve(nimbus: Nimbus, shutdown: CancellationToken) -> NimbusResult<()> {
    let listener = TcpListener::bind(*nimbus.config().get_server_addr()).await?;
    serve_with_listener(nimbus, listener, shutdown).await
}

/// Serves the REST API on an already bound listener until `shutdown` is cancelled.
pub async fn serve_with_listener(
    nimbus: Nimbus,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> NimbusResult<()> {
    let addr: SocketAddr = listener.local_addr()?;
    if nimbus.config().get_server_key().is_some() {
        tracing::info!("server running in secure mode with API key authentication");
    } else {
        tracing::warn!("server running in local mode; the team is taken from the X-Nimbus-Team header");
    }

    let state = ServerState::new(nimbus);
    let pruner = spawn_rate_limit_pruner(
        state.limiter().clone(),
        RATE_LIMIT_PRUNE_INTERVAL,
        shutdown.clone(),
    );
    let app = create_router(state);
    tracing::info!(%addr, "server listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await;

    shutdown.cancel();
    if let Err(e) = pruner.await {
        tracing::warn!(error = %e, "rate limit pruner failed");
    }
    served?;

    tracing::info!("server stopped");
    Ok(())
}
