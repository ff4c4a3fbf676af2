//! Admin surface — CRUD for per-client rate limits.
//!
//! DESIGN
//! ======
//! Thin handlers over the quota store. Every failure carries the standard
//! structured body; storage errors are mapped by kind, never by message.
//! Changes take effect on a client's next request: the engine reconciles
//! bucket limits against the store on every revisit.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::response::error_response;
use crate::state::AppState;
use crate::storage::{QuotaRecord, QuotaStore, StorageError};

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClientLimit {
    pub rate: f64,
    pub capacity: f64,
}

#[derive(Debug, Deserialize)]
pub struct ClientLimitRequest {
    #[serde(default)]
    pub client_id: String,
    pub limit: ClientLimit,
}

#[derive(Debug, Serialize)]
pub struct ClientLimitResponse {
    pub client_id: String,
    pub limit: ClientLimit,
}

impl From<ClientLimit> for QuotaRecord {
    fn from(limit: ClientLimit) -> Self {
        Self { rate: limit.rate, capacity: limit.capacity }
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `POST /clients` — create a client limit.
pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<ClientLimitRequest>, JsonRejection>,
) -> Response {
    let Some(store) = &state.store else {
        return store_unavailable();
    };
    let body = match parse_body(payload) {
        Ok(body) => body,
        Err(response) => return response,
    };
    if body.client_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "client_id is required");
    }
    if let Err(response) = validate_limit(body.limit) {
        return response;
    }

    match store.create_quota(&body.client_id, body.limit.into()).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(ClientLimitResponse { client_id: body.client_id, limit: body.limit }),
        )
            .into_response(),
        Err(e) => storage_error_response(&e),
    }
}

/// `GET /clients` — listing is not offered.
pub async fn list(State(state): State<AppState>) -> Response {
    if state.store.is_none() {
        return store_unavailable();
    }
    error_response(StatusCode::NOT_IMPLEMENTED, "listing clients is not implemented")
}

/// `GET /clients/{id}` — fetch a client limit.
pub async fn get_one(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    let Some(store) = &state.store else {
        return store_unavailable();
    };

    match store.get_quota(&client_id).await {
        Ok(Some(record)) => Json(ClientLimitResponse {
            client_id,
            limit: ClientLimit { rate: record.rate, capacity: record.capacity },
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("client '{client_id}' not found")),
        Err(e) => storage_error_response(&e),
    }
}

/// `PUT /clients/{id}` — replace a client limit.
pub async fn update(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    payload: Result<Json<ClientLimitRequest>, JsonRejection>,
) -> Response {
    let Some(store) = &state.store else {
        return store_unavailable();
    };
    let body = match parse_body(payload) {
        Ok(body) => body,
        Err(response) => return response,
    };
    if !body.client_id.is_empty() && body.client_id != client_id {
        return error_response(StatusCode::BAD_REQUEST, "client_id in body does not match the path");
    }
    if let Err(response) = validate_limit(body.limit) {
        return response;
    }

    match store.update_quota(&client_id, body.limit.into()).await {
        Ok(()) => Json(ClientLimitResponse { client_id, limit: body.limit }).into_response(),
        Err(e) => storage_error_response(&e),
    }
}

/// `DELETE /clients/{id}` — remove a client limit.
pub async fn remove(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    let Some(store) = &state.store else {
        return store_unavailable();
    };

    match store.delete_quota(&client_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => storage_error_response(&e),
    }
}

/// Paths below `/clients/{id}` are part of the admin surface but name
/// nothing.
pub async fn nested_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "no such admin resource")
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_body(payload: Result<Json<ClientLimitRequest>, JsonRejection>) -> Result<ClientLimitRequest, Response> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            Err(error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {rejection}")))
        }
    }
}

fn validate_limit(limit: ClientLimit) -> Result<(), Response> {
    if limit.rate <= 0.0 || limit.capacity <= 0.0 {
        return Err(error_response(StatusCode::BAD_REQUEST, "rate and capacity must be positive"));
    }
    Ok(())
}

fn store_unavailable() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "client limit store is unavailable")
}

fn storage_error_response(e: &StorageError) -> Response {
    if e.is_not_found() {
        error_response(StatusCode::NOT_FOUND, e.to_string())
    } else if e.is_already_exists() {
        error_response(StatusCode::CONFLICT, e.to_string())
    } else {
        error!(error = %e, "storage failure in admin API");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
    }
}

#[cfg(test)]
#[path = "clients_test.rs"]
mod tests;
