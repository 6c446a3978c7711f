//! HTTP routes
//!
//! Probes and read-only aggregate statistics. `/readyz` answers 204 only
//! when both backing stores are reachable, so the deployment platform
//! withholds traffic from replicas that cannot serve.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;
use sqlx::Row;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub lock_store: redis::Client,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/stats", get(get_stats))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Liveness probe
async fn livez() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Readiness probe: both backing stores must answer
async fn readyz(State(state): State<AppState>) -> StatusCode {
    if let Err(e) = sqlx::query("SELECT 1").fetch_one(&state.db).await {
        tracing::error!(error = %e, "Database readiness check failed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.lock_store.get_multiplexed_async_connection().await {
        Ok(mut conn) => {
            let pong: Result<String, redis::RedisError> =
                redis::cmd("PING").query_async(&mut conn).await;
            if let Err(e) = pong {
                tracing::error!(error = %e, "Lock store readiness check failed");
                return StatusCode::SERVICE_UNAVAILABLE;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Lock store readiness check failed");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }

    StatusCode::NO_CONTENT
}

/// Aggregate statistics over the three record kinds
async fn get_stats(State(state): State<AppState>) -> Result<Response, StatusCode> {
    let events = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events").fetch_one(&state.db);
    let tickets =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM freshservice").fetch_one(&state.db);
    let access_logs =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM apistats").fetch_one(&state.db);

    let (events, tickets, access_logs) = tokio::join!(events, tickets, access_logs);

    let (events, tickets, access_logs) = match (events, tickets, access_logs) {
        (Ok(e), Ok(t), Ok(a)) => (e, t, a),
        _ => {
            tracing::error!("Failed to fetch stats from database");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let by_type = sqlx::query(
        "SELECT event_type, COUNT(*) AS count FROM events GROUP BY event_type ORDER BY count DESC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to fetch event-type breakdown");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let events_by_type: serde_json::Map<String, serde_json::Value> = by_type
        .iter()
        .map(|row| {
            (
                row.get::<String, _>("event_type"),
                json!(row.get::<i64, _>("count")),
            )
        })
        .collect();

    Ok((
        StatusCode::OK,
        Json(json!({
            "events": events,
            "tickets": tickets,
            "access_logs": access_logs,
            "events_by_type": events_by_type,
        })),
    )
        .into_response())
}
