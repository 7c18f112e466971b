//! HTTP surface: the cached reverse proxy and its server loop.

mod middleware;

use std::{future::IntoFuture, net::SocketAddr, pin::pin, sync::Arc};

use axum::{
    Router,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::get,
};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{info, warn};

pub use middleware::log_responses;

use crate::{
    cache::{CacheState, page_cache_layer},
    config::ServerSettings,
};

use super::{
    error::InfraError,
    upstream::{UpstreamOrigin, proxy},
};

/// Path answered directly, outside the cache.
pub const HEALTH_PATH: &str = "/_health";

/// Builds the router: every path except the health probe goes through the
/// page cache and then to the upstream origin.
pub fn build_router(cache: CacheState, origin: Arc<UpstreamOrigin>) -> Router {
    let cached = Router::new()
        .fallback(proxy)
        .with_state(origin)
        .layer(from_fn_with_state(cache, page_cache_layer));

    Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(cached)
        .layer(from_fn(log_responses))
}

async fn health() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// Serves the router until a shutdown signal, then drains for the grace period.
pub async fn serve(settings: &ServerSettings, router: Router) -> Result<(), InfraError> {
    let listener = TcpListener::bind(settings.addr).await.map_err(|err| {
        InfraError::server(format!("failed to bind {}: {err}", settings.addr))
    })?;
    info!(addr = %settings.addr, "listening");

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { signal.notified().await });

    let mut server = pin!(server.into_future());

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| InfraError::server(format!("server error: {err}")));
        }
        () = shutdown_signal() => {}
    }

    shutdown.notify_one();
    let grace = settings.graceful_shutdown;
    info!(grace_seconds = grace.as_secs(), "draining in-flight requests");
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.map_err(|err| InfraError::server(format!("server error: {err}"))),
        Err(_) => {
            warn!("grace period elapsed with requests still in flight");
            Ok(())
        }
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
