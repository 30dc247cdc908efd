//! Admin HTTP surface: conversation-config CRUD and health.
//!
//! `POST /conversations/{id}/config` merges the submitted fields into the
//! stored config and returns the full merged view; `null` fields leave prior
//! values intact. `GET` never 404s: unset configs come back as a defaults
//! envelope. Both honor the gateway bearer token.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::conversation::ConversationConfig;
use crate::gateway::GatewayState;

/// Merged config view returned by both endpoints.
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub conversation_id: Uuid,
    #[serde(flatten)]
    pub config: ConversationConfig,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn update_config(
    State(state): State<Arc<GatewayState>>,
    Path(conversation_id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<ConversationConfig>,
) -> Result<Json<ConfigResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let merged = state
        .conversation_config
        .merge(conversation_id, &update)
        .await
        .map_err(|e| match e {
            crate::error::PlatformError::Config(msg) => (StatusCode::BAD_REQUEST, msg),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;
    info!("updated config for {conversation_id}");
    Ok(Json(ConfigResponse {
        conversation_id,
        config: merged,
    }))
}

pub async fn get_config(
    State(state): State<Arc<GatewayState>>,
    Path(conversation_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ConfigResponse>, (StatusCode, String)> {
    authorize(&state, &headers)?;
    let config = state
        .conversation_config
        .load(conversation_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(ConfigResponse {
        conversation_id,
        config,
    }))
}

fn authorize(state: &GatewayState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(expected) = state.config.gateway.auth_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid bearer token".to_owned()))
    }
}
