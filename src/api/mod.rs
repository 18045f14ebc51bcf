pub mod error;

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::controller::{AppState, ControlCommand, ControlSnapshot, OverrideRequest};

use error::ApiError;

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(get_state))
        .route("/override/:output", post(post_override))
        .route("/refresh", post(post_refresh))
        .route("/webhook", post(post_webhook))
        .with_state(state.clone());

    if let Some(key) = state.access_key.clone() {
        app = app.layer(middleware::from_fn(
            move |req: Request<axum::body::Body>, next: Next| {
                let key = key.clone();
                check_access_key(req, next, key)
            },
        ));
    }
    app.layer(TraceLayer::new_for_http())
}

/// Bearer-token guard applied when an access key is configured.
async fn check_access_key(
    req: Request<axum::body::Body>,
    next: Next,
    key: String,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == key => Ok(next.run(req).await),
        _ => Err(ApiError::Unauthorized),
    }
}

/// GET / - current state of every output, the plans and UPS health.
async fn get_state(State(state): State<AppState>) -> Json<ControlSnapshot> {
    Json(state.snapshot.borrow().clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverrideBody {
    state: String,
    #[serde(default)]
    ttl_minutes: Option<u64>,
}

#[derive(Debug, serde::Serialize)]
struct Accepted {
    ok: bool,
}

/// POST /override/{output} with {state: on|off|auto, ttlMinutes?}.
/// Applying the same override twice is a no-op.
async fn post_override(
    State(state): State<AppState>,
    Path(output): Path<String>,
    Json(body): Json<OverrideBody>,
) -> Result<Json<Accepted>, ApiError> {
    let request = match body.state.as_str() {
        "on" => OverrideRequest::On,
        "off" => OverrideRequest::Off,
        "auto" => OverrideRequest::Auto,
        other => {
            return Err(ApiError::BadRequest(format!(
                "state must be on, off or auto, got '{other}'"
            )))
        }
    };

    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(ControlCommand::SetOverride {
            output,
            request,
            ttl_minutes: body.ttl_minutes,
            reply,
        })
        .await
        .map_err(|_| ApiError::ServiceUnavailable("controller stopped".to_string()))?;

    match tokio::time::timeout(Duration::from_secs(5), rx).await {
        Ok(Ok(Ok(()))) => Ok(Json(Accepted { ok: true })),
        Ok(Ok(Err(message))) => Err(ApiError::NotFound(message)),
        Ok(Err(_)) => Err(ApiError::InternalError("controller dropped reply".to_string())),
        Err(_) => Err(ApiError::ServiceUnavailable("controller busy".to_string())),
    }
}

/// POST /refresh - ask the price refresher for an immediate fetch.
async fn post_refresh(State(state): State<AppState>) -> Result<Json<Accepted>, ApiError> {
    state
        .refresh
        .send(())
        .await
        .map_err(|_| ApiError::ServiceUnavailable("refresher stopped".to_string()))?;
    Ok(Json(Accepted { ok: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody {
    device_id: String,
    #[serde(default)]
    input: Option<u32>,
    #[serde(default)]
    state: Option<bool>,
}

/// POST /webhook - unsolicited input-pin notification from a device. The
/// controller refreshes that device's status and re-evaluates.
async fn post_webhook(
    State(state): State<AppState>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<Accepted>, ApiError> {
    tracing::debug!(
        device = %body.device_id,
        input = ?body.input,
        state = ?body.state,
        "input webhook received"
    );
    state
        .commands
        .send(ControlCommand::InputWebhook {
            device: body.device_id,
        })
        .await
        .map_err(|_| ApiError::ServiceUnavailable("controller stopped".to_string()))?;
    Ok(Json(Accepted { ok: true }))
}
