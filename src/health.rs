use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config;
use crate::metrics;
use crate::server::Server;

struct HealthState {
    servers: Vec<Arc<Server>>,
    started_at: Instant,
}

/// Serve the health/status/metrics endpoints until shutdown.
///
/// Failures are logged, the surface is never load-bearing for the core.
pub async fn run(
    servers: Vec<Arc<Server>>,
    cfg: config::Health,
    started_at: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let ip: IpAddr = match cfg.host.parse() {
        Ok(ip) => ip,
        Err(_) => {
            error!(
                target: "craftnap::health",
                "Invalid health.host '{}', health endpoint disabled",
                cfg.host
            );
            return;
        }
    };
    let addr = SocketAddr::new(ip, cfg.port);

    let state = Arc::new(HealthState {
        servers,
        started_at,
    });
    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus))
        .with_state(state);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                target: "craftnap::health",
                "Cannot bind health endpoint on {}: {}",
                addr,
                err
            );
            return;
        }
    };
    info!(target: "craftnap::health", "Health endpoint listening on {}", addr);

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    if let Err(err) = serve.await {
        error!(target: "craftnap::health", "Health endpoint failed: {}", err);
    } else {
        info!(target: "craftnap::health", "Health endpoint stopped");
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    let now = Instant::now();
    let mut servers = serde_json::Map::new();
    for server in &state.servers {
        let snap = server.snapshot(now).await;
        servers.insert(
            snap.name.clone(),
            json!({
                "state": snap.state.as_str(),
                "port": snap.port,
                "edition": snap.edition.as_str(),
                "players_online": snap.players_online,
                "players_max": snap.players_max,
                "version": snap.version,
                "idle_seconds": snap.idle_seconds,
                "start_count": snap.start_count,
                "stop_count": snap.stop_count,
            }),
        );
    }

    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "servers": servers,
    }))
}

async fn prometheus(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let now = Instant::now();
    let mut snapshots = Vec::with_capacity(state.servers.len());
    for server in &state.servers {
        snapshots.push(server.snapshot(now).await);
    }
    let body = metrics::render(&snapshots, state.started_at.elapsed());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
