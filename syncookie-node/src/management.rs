use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::ManagementApiConfig;
use crate::engine::{SyncookieEngine, SyncookieSettings};
use crate::error::SyncookieError;
use crate::status::StatusSnapshot;

/// Management API state
#[derive(Clone)]
pub struct ManagementState {
    /// Configuration
    pub config: ManagementApiConfig,
    /// Engine of the network context being managed
    pub engine: Arc<SyncookieEngine>,
}

/// Syncookie configuration update
#[derive(Debug, Deserialize)]
pub struct SyncookieUpdate {
    pub enabled: bool,
    pub adaptive: bool,
    #[serde(rename = "highwater")]
    pub hiwat: u64,
    #[serde(rename = "lowwater")]
    pub lowat: u64,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: StatusSnapshot,
    pub timestamp: String,
}

/// Constant-time bearer token comparison
fn token_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Authentication middleware
async fn auth_middleware(
    State(state): State<ManagementState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = state
        .config
        .auth_token
        .as_ref()
        .map(|token| token.expose_secret().as_str())
        .unwrap_or("");
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
        Some(token) if token_matches(token, expected) => Ok(next.run(request).await),
        Some(_) => {
            warn!("Invalid management API token provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or invalid Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Create management API router
pub fn create_management_router(state: ManagementState) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/syncookies", get(handle_get_syncookies).put(handle_set_syncookies))
        .route("/syncookies/status", get(handle_syncookie_status));

    let router = if state.config.auth_token.is_some() {
        router.layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
    } else {
        router
    };

    router.with_state(state)
}

/// Start the management API server
#[instrument(skip(config, engine, cancel))]
pub async fn start_management_api(
    config: ManagementApiConfig,
    engine: Arc<SyncookieEngine>,
    cancel: CancellationToken,
) -> Result<()> {
    if !config.enabled {
        info!("Management API is disabled");
        return Ok(());
    }

    if config.auth_token.is_none() {
        warn!("Management API has no auth token configured");
    }

    let state = ManagementState {
        config: config.clone(),
        engine,
    };
    let app = create_management_router(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    info!(
        addr = %config.listen_addr,
        "Management API server listening"
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        error!(error = %e, "Management API server failed");
        return Err(e.into());
    }

    Ok(())
}

/// Health check endpoint for management API
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "syncookie-node-management",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn handle_get_syncookies(State(state): State<ManagementState>) -> Json<SyncookieSettings> {
    Json(state.engine.get_config())
}

#[instrument(skip(state))]
async fn handle_set_syncookies(
    State(state): State<ManagementState>,
    Json(update): Json<SyncookieUpdate>,
) -> Result<Json<SyncookieSettings>, (StatusCode, Json<ErrorResponse>)> {
    match state
        .engine
        .set_config(update.enabled, update.adaptive, update.hiwat, update.lowat)
    {
        Ok(()) => {
            info!(
                enabled = update.enabled,
                adaptive = update.adaptive,
                hiwat = update.hiwat,
                lowat = update.lowat,
                "Syncookie configuration updated"
            );
            Ok(Json(state.engine.get_config()))
        }
        Err(e) => {
            let status = match &e {
                SyncookieError::InvalidWatermarks { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(error = %e, "Rejected syncookie configuration update");
            Err((
                status,
                Json(ErrorResponse {
                    success: false,
                    message: e.to_string(),
                }),
            ))
        }
    }
}

async fn handle_syncookie_status(State(state): State<ManagementState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.engine.stats(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
