//! Health check endpoint.
//!
//! Read-only aggregate of broker and storage reachability for external
//! liveness/readiness tooling. Broker state comes from the supervisor's
//! published status; the storage probe is a time-boxed `SELECT 1`. Neither
//! check has side effects on the pipeline.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use courier_common::types::ConnectionState;

use crate::state::AppState;

const STORAGE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct DependencyCheck {
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let broker = broker_check(&state);
    let storage = storage_check(&state).await;
    let healthy = broker.healthy && storage.healthy;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": "courier",
            "version": env!("CARGO_PKG_VERSION"),
            "checks": {
                "broker": broker,
                "storage": storage,
            }
        })),
    )
}

fn broker_check(state: &AppState) -> DependencyCheck {
    let status = state.broker.borrow().clone();
    let healthy = status.state == ConnectionState::Connected;

    DependencyCheck {
        healthy,
        state: Some(status.state.to_string()),
        reason: if healthy {
            None
        } else {
            status
                .detail
                .or_else(|| Some(format!("broker connection is {}", status.state)))
        },
    }
}

async fn storage_check(state: &AppState) -> DependencyCheck {
    let probe = sqlx::query("SELECT 1").execute(&state.pool);

    match tokio::time::timeout(STORAGE_PROBE_TIMEOUT, probe).await {
        Ok(Ok(_)) => DependencyCheck {
            healthy: true,
            state: None,
            reason: None,
        },
        Ok(Err(e)) => DependencyCheck {
            healthy: false,
            state: None,
            reason: Some(e.to_string()),
        },
        Err(_) => DependencyCheck {
            healthy: false,
            state: None,
            reason: Some("storage probe timed out".to_string()),
        },
    }
}
