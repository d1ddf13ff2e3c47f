//! Health check endpoint: reports whether the database and the intake broker
//! answer. Degraded dependencies turn the response into a 503.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

fn reachability(result: &Result<(), herald_common::error::AppError>) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(_) => "unreachable",
    }
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let (database, queue) = tokio::join!(state.store.ping(), state.queue.ping());

    if let Err(e) = &database {
        tracing::warn!(error = %e, "Health check: database unreachable");
    }
    if let Err(e) = &queue {
        tracing::warn!(error = %e, "Health check: queue unreachable");
    }

    let healthy = database.is_ok() && queue.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "herald-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": reachability(&database),
            "queue": reachability(&queue),
        })),
    )
}
