//! Health endpoint.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use crate::dispatch::TransportProbe;
use crate::util::now_millis;

/// The poller is considered stuck after this many seconds without a
/// successful cycle.
const DEGRADED_AFTER_SECS: f64 = 120.0;

struct HealthState {
    started_at: Instant,
    probe: Arc<dyn TransportProbe>,
}

pub fn router(probe: Arc<dyn TransportProbe>) -> Router {
    let state = Arc::new(HealthState {
        started_at: Instant::now(),
        probe,
    });
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<serde_json::Value> {
    let poll_seconds_ago = state
        .probe
        .last_poll_at()
        .map(|at| (now_millis() - at) as f64 / 1000.0);

    Json(serde_json::json!({
        "status": health_status(poll_seconds_ago),
        "service": "paibridge",
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "last_poll_seconds_ago": poll_seconds_ago.unwrap_or(-1.0),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

fn health_status(poll_seconds_ago: Option<f64>) -> &'static str {
    match poll_seconds_ago {
        Some(ago) if ago <= DEGRADED_AFTER_SECS => "ok",
        _ => "degraded",
    }
}

pub async fn serve(port: u16, probe: Arc<dyn TransportProbe>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health server listening");
    axum::serve(listener, router(probe)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_degrades_without_recent_polls() {
        assert_eq!(health_status(None), "degraded");
        assert_eq!(health_status(Some(5.0)), "ok");
        assert_eq!(health_status(Some(119.9)), "ok");
        assert_eq!(health_status(Some(500.0)), "degraded");
    }
}
