//! Tunnel relay server entry point: wires config, the control-channel
//! gateway, and the public ingress router together and starts serving.

mod auth;
mod config;
mod gateway;
mod ingress;
mod pending;
mod rate_limit;
mod registry;
mod reserved;

use crate::auth::{AuthProvider, OpenAuthProvider, StaticAuthProvider};
use crate::config::Config;
use crate::gateway::WSGateway;
use crate::ingress::{health_check, ingress_handler, verify_tunnel};
use crate::rate_limit::RateLimiter;
use crate::registry::TunnelRegistry;
use crate::reserved::ReservedNames;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;

async fn ws_upgrade_handler(
    State(gateway): State<Arc<WSGateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_ip = addr.ip().to_string();
    if !gateway.rate_limiter.allow_connection(&remote_ip) {
        return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
    }
    ws.on_upgrade(move |socket| async move {
        gateway.handle_socket(socket, remote_ip).await;
    })
}

fn build_auth_provider(config: &Config) -> Arc<dyn AuthProvider> {
    match (&config.api_key, &config.account_id) {
        (Some(key), Some(account)) => Arc::new(StaticAuthProvider::single_key(key.clone(), account.clone())),
        _ if config.require_auth => Arc::new(StaticAuthProvider::new(HashMap::new())),
        _ => Arc::new(OpenAuthProvider),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sellia_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let auth = build_auth_provider(&config);
    let registry = Arc::new(TunnelRegistry::new(ReservedNames::default()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_enabled));
    let gateway = Arc::new(WSGateway::new(
        registry,
        rate_limiter,
        auth,
        config.base_domain.clone(),
        config.public_scheme.clone(),
    ));

    tokio::spawn(gateway.clone().run_liveness_sweep());
    tokio::spawn(gateway.rate_limiter.clone().run_eviction_sweep());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/tunnel/verify", get(verify_tunnel))
        .route("/ws", get(ws_upgrade_handler))
        .fallback(ingress_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, base_domain = %config.base_domain, "sellia-server listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
