//! Gateway HTTP server.

use crate::client::BridgeClient;
use crate::config::{self, Config};
use crate::dispatch::Dispatcher;
use crate::pairing::{PairingPresenter, TerminalSurface};
use crate::session::SessionManager;
use crate::store::{CredentialStore, FileCredentialStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
}

impl GatewayState {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            dispatcher: Dispatcher::new(session),
        }
    }
}

/// Routes: `POST /send`, `GET /health`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/send", post(send_http))
        .route("/health", get(health_http))
        .with_state(state)
}

/// Wire the production collaborators: file credential store, bridge client, terminal presenter.
pub fn build_session(config: &Config) -> Arc<SessionManager> {
    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(config::resolve_store_path(config)));
    let client = Arc::new(BridgeClient::new(
        config::resolve_bridge_url(config),
        config::resolve_bridge_token(config),
        store.clone(),
    ));
    let presenter = PairingPresenter::new(Arc::new(TerminalSurface::new(config.pairing.render)));
    Arc::new(
        SessionManager::new(client, store, presenter).with_send_timeout(config::send_timeout(config)),
    )
}

/// Run the gateway: establish the session (pairing if needed), then serve HTTP on
/// config.gateway.bind:config.gateway.port until SIGINT/SIGTERM.
/// The listener is bound only after the session is connected; a session failure aborts startup.
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway bound to non-loopback address {}; the HTTP API has no authentication",
            bind
        );
    }

    let session = build_session(&config);
    session
        .establish()
        .await
        .context("establishing messaging session")?;

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on http://{}", bind_addr);

    let served = serve(listener, session.clone(), shutdown_signal()).await;
    session.disconnect().await;
    log::info!("gateway stopped");
    served
}

/// Serve the routes on an already-bound listener until `shutdown` completes.
pub async fn serve<F>(listener: TcpListener, session: Arc<SessionManager>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(GatewayState::new(session)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

/// POST /send — body `{"to", "text"}`; 200/400/500 with a JSON body.
async fn send_http(State(state): State<GatewayState>, body: Bytes) -> (StatusCode, Json<serde_json::Value>) {
    let (status, body) = state.dispatcher.handle(&body).await;
    (status, Json(body))
}

/// GET /health — plain "OK" for liveness probes.
async fn health_http() -> &'static str {
    "OK"
}
