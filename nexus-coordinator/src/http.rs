/**
 * DISPLAY API - HTTP surface for the front desk
 *
 * ROLE :
 * Read-only fleet view plus the payment action, for dashboards and scripts.
 *
 * HOW IT WORKS :
 * - Axum router, JSON responses
 * - GET /health            -> coordinator counters
 * - GET /fleet             -> consistent snapshot of every connected endpoint
 * - GET /fleet/{id}        -> one endpoint (404 when not connected)
 * - POST /fleet/{id}/pay   -> settle the ledger, queue the kill directive
 * - Every read goes through `FleetStore::snapshot`, so a half-applied report
 *   is never served
 */

use crate::fleet::FleetStore;
use crate::health::{CoordinatorHealth, HealthTracker};
use crate::models::{EndpointView, FleetSnapshot, PaymentReceipt};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetStore>,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/fleet", get(get_fleet))
        .route("/fleet/{id}", get(get_endpoint))
        .route("/fleet/{id}/pay", post(pay_endpoint))
        .with_state(app_state)
}

/// Binds the display API and serves it in the background.
pub async fn spawn_http(port: u16, app_state: AppState) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    let router = build_router(app_state);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "display API stopped");
        }
    });

    info!(%addr, "display API listening");
    Ok(addr)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<CoordinatorHealth> {
    Json(app.health.get_health(&app.fleet))
}

// GET /fleet
async fn get_fleet(State(app): State<AppState>) -> Json<FleetSnapshot> {
    Json(app.fleet.snapshot())
}

// GET /fleet/{id}
async fn get_endpoint(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EndpointView>, StatusCode> {
    app.fleet.endpoint_view(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// POST /fleet/{id}/pay
async fn pay_endpoint(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PaymentReceipt>, (StatusCode, Json<serde_json::Value>)> {
    if id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "empty endpoint id" })),
        ));
    }

    app.fleet.mark_paid(&id).map(Json).map_err(|e| {
        error!(endpoint = %id, error = %e, "payment failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use nexus_protocol::Heartbeat;

    fn app() -> AppState {
        let fleet = Arc::new(FleetStore::new(Arc::new(MemorySessionStore::new()), 50_000));
        AppState {
            fleet,
            health: HealthTracker::new(),
        }
    }

    #[tokio::test]
    async fn test_fleet_and_endpoint_views() {
        let app = app();
        let conn = app.fleet.attach();
        app.fleet.apply_report(conn, &Heartbeat::new("PC-03", "valorant.exe", 0));

        let Json(snapshot) = get_fleet(State(app.clone())).await;
        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.endpoints[0].current_activity, "valorant.exe");

        let Json(view) = get_endpoint(State(app.clone()), Path("PC-03".into())).await.unwrap();
        assert_eq!(view.sessions.len(), 1);

        let missing = get_endpoint(State(app), Path("PC-99".into())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pay_queues_kill() {
        let app = app();
        let conn = app.fleet.attach();
        app.fleet.apply_report(conn, &Heartbeat::new("PC-03", "valorant.exe", 0));

        let Json(receipt) = pay_endpoint(State(app.clone()), Path("PC-03".into())).await.unwrap();
        assert_eq!(receipt.sessions_paid, 1);
        assert!(receipt.kill_requested);

        let response = app.fleet.apply_report(conn, &Heartbeat::new("PC-03", "valorant.exe", 0));
        assert!(response.close_active_game);

        let blank = pay_endpoint(State(app), Path("  ".into())).await;
        assert_eq!(blank.unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_connected_endpoints() {
        let app = app();
        let conn = app.fleet.attach();
        app.fleet.apply_report(conn, &Heartbeat::new("PC-01", "Idle", 0));

        let Json(health) = get_health(State(app)).await;
        assert_eq!(health.connected_endpoints, 1);
    }

    #[tokio::test]
    async fn test_router_serves_over_tcp() {
        let app = app();
        let addr = spawn_http(0, app).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /fleet HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"endpoints\":[]"));
    }
}
