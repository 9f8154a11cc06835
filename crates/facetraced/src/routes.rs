//! HTTP surface of the worker.
//!
//! Every POST endpoint checks the shared secret first, then validates the
//! request, and only then hands work to the engine thread.

use crate::engine::{EngineHandle, SearchOutcome};
use crate::error::{Result, ServiceError};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facetrace_core::search::QueryRejection;
use facetrace_core::selfie::SelfieOutcome;
use facetrace_core::MediaItem;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub secret: Arc<str>,
    pub max_selfie_bytes: usize,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/process-gallery", post(handler_process_gallery))
        .route("/embed-selfie", post(handler_embed_selfie))
        .route("/search-faces", post(handler_search_faces))
        .route("/status", get(handler_status))
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct GalleryRequest {
    media_items: Option<Vec<MediaItem>>,
    event_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SelfieRequest {
    image_base64: Option<String>,
    event_id: Option<String>,
}

/// Equality check whose timing does not depend on where the inputs differ.
fn secrets_match(provided: &[u8], expected: &[u8]) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

fn authorize(state: &AppState, provided: Option<&str>) -> Result<()> {
    match provided {
        Some(secret) if secrets_match(secret.as_bytes(), state.secret.as_bytes()) => Ok(()),
        _ => Err(ServiceError::Unauthorized),
    }
}

/// Authorize on the raw JSON body, then deserialize it into the typed request.
///
/// A body that is not JSON carries no readable secret and is unauthorized.
fn authorized_request<T: DeserializeOwned>(
    state: &AppState,
    body: core::result::Result<Json<Value>, JsonRejection>,
) -> Result<T> {
    let Ok(Json(value)) = body else {
        return Err(ServiceError::Unauthorized);
    };
    authorize(state, value.get("secret").and_then(Value::as_str))?;
    serde_json::from_value(value).map_err(|e| ServiceError::Validation(format!("invalid request body: {e}")))
}

fn decode_selfie(state: &AppState, image_base64: Option<&str>) -> Result<Vec<u8>> {
    let encoded = match image_base64 {
        Some(s) if !s.is_empty() => s,
        _ => return Err(ServiceError::Validation("missing image_base64".into())),
    };
    // Line wrapping and stray whitespace are ignored.
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|_| ServiceError::Validation("invalid base64".into()))?;
    if bytes.len() > state.max_selfie_bytes {
        return Err(ServiceError::Validation(format!(
            "image too large: {} bytes (max {})",
            bytes.len(),
            state.max_selfie_bytes
        )));
    }
    Ok(bytes)
}

fn no_face_body() -> Json<Value> {
    Json(json!({ "error": "no_face_detected", "face_count": 0 }))
}

async fn handler_process_gallery(
    State(state): State<AppState>,
    body: core::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    let req: GalleryRequest = authorized_request(&state, body)?;

    let (event_id, items) = match (req.event_id, req.media_items) {
        (Some(event_id), Some(items)) if !event_id.is_empty() && !items.is_empty() => (event_id, items),
        _ => return Err(ServiceError::Validation("missing event_id or media_items".into())),
    };

    tracing::info!(event_id = %event_id, items = items.len(), "gallery batch received");
    let summary = state.engine.process_gallery(event_id, items).await?;
    Ok(Json(json!(summary)))
}

async fn handler_embed_selfie(
    State(state): State<AppState>,
    body: core::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    let req: SelfieRequest = authorized_request(&state, body)?;
    let image = decode_selfie(&state, req.image_base64.as_deref())?;

    match state.engine.embed_selfie(image).await? {
        SelfieOutcome::NoFace => Ok(no_face_body()),
        SelfieOutcome::Face {
            embedding,
            confidence,
            face_count,
        } => Ok(Json(json!({
            "embedding": embedding.values,
            "confidence": confidence,
            "face_count": face_count,
        }))),
    }
}

async fn handler_search_faces(
    State(state): State<AppState>,
    body: core::result::Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let req: SelfieRequest = authorized_request(&state, body)?;
    let event_id = match req.event_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ServiceError::Validation("missing event_id".into())),
    };
    let image = decode_selfie(&state, req.image_base64.as_deref())?;

    match state.engine.search_faces(image, event_id).await? {
        SearchOutcome::NoFace => Ok((StatusCode::OK, no_face_body())),
        SearchOutcome::LowQuality(rejection) => {
            let mut body = json!({ "error": "low_quality_selfie", "message": rejection.to_string() });
            if let QueryRejection::LowConfidence(confidence) = rejection {
                body["confidence"] = json!(confidence);
            }
            Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)))
        }
        SearchOutcome::Matches { face_count, result } => Ok((
            StatusCode::OK,
            Json(json!({
                "face_count": face_count,
                "tier1": result.tier1,
                "tier2": result.tier2,
            })),
        )),
    }
}

async fn handler_status() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "models_loaded": true,
    }))
}
