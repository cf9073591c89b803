use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api::AppState;

/// Component health map. Database, cache and storage gate the overall
/// verdict; the broker is advisory because the read path never touches it.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let cache = state.cache.probe().await.is_ok();
    let storage = state.storage.probe().await.is_ok();
    let broker = state.broker.is_connected().await;

    let healthy = database && cache && storage;
    let status = if !healthy {
        "unhealthy"
    } else if broker {
        "ok"
    } else {
        "degraded"
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "components": {
                "database": up_down(database),
                "cache": up_down(cache),
                "storage": up_down(storage),
                "broker": up_down(broker),
            },
        })),
    )
}

fn up_down(up: bool) -> &'static str {
    if up {
        "up"
    } else {
        "down"
    }
}
