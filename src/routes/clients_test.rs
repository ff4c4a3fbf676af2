use super::*;

use std::sync::Arc;

use axum::extract::{Path, State};

use crate::pool::{BackendPool, Policy};
use crate::rate_limit::RateLimiter;
use crate::response::ErrorBody;
use crate::storage::Db;

async fn admin_state() -> AppState {
    let urls = vec!["http://backend:9001".to_string()];
    let pool = Arc::new(BackendPool::new(&urls, Policy::RoundRobin).unwrap());
    let db = Arc::new(Db::open_in_memory().await.unwrap());
    AppState::new(pool, RateLimiter::disabled(), Some(db)).unwrap()
}

fn storeless_state() -> AppState {
    let urls = vec!["http://backend:9001".to_string()];
    let pool = Arc::new(BackendPool::new(&urls, Policy::RoundRobin).unwrap());
    AppState::new(pool, RateLimiter::disabled(), None).unwrap()
}

fn request(client_id: &str, rate: f64, capacity: f64) -> Json<ClientLimitRequest> {
    Json(ClientLimitRequest {
        client_id: client_id.to_string(),
        limit: ClientLimit { rate, capacity },
    })
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn error_body(response: Response) -> ErrorBody {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_persists_and_returns_created() {
    let state = admin_state().await;

    let response = create(State(state.clone()), Ok(request("c1", 2.0, 4.0))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["client_id"], "c1");
    assert_eq!(body["limit"]["rate"], 2.0);
    assert_eq!(body["limit"]["capacity"], 4.0);

    let fetched = get_one(State(state), Path("c1".to_string())).await;
    assert_eq!(fetched.status(), StatusCode::OK);
    let body = body_json(fetched).await;
    assert_eq!(body["limit"]["capacity"], 4.0);
}

#[tokio::test]
async fn create_duplicate_is_conflict() {
    let state = admin_state().await;
    let response = create(State(state.clone()), Ok(request("c1", 1.0, 1.0))).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = create(State(state), Ok(request("c1", 9.0, 9.0))).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(error_body(response).await.code, 409);
}

#[tokio::test]
async fn create_requires_client_id() {
    let state = admin_state().await;
    let response = create(State(state), Ok(request("", 1.0, 1.0))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_rejects_non_positive_limits() {
    let state = admin_state().await;
    let response = create(State(state.clone()), Ok(request("c1", 0.0, 1.0))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = create(State(state), Ok(request("c1", 1.0, -2.0))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_missing_client_is_not_found() {
    let state = admin_state().await;
    let response = get_one(State(state), Path("ghost".to_string())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_body(response).await.code, 404);
}

#[tokio::test]
async fn update_replaces_limit() {
    let state = admin_state().await;
    create(State(state.clone()), Ok(request("c1", 1.0, 1.0))).await;

    let response = update(State(state.clone()), Path("c1".to_string()), Ok(request("c1", 5.0, 6.0))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let fetched = get_one(State(state), Path("c1".to_string())).await;
    let body = body_json(fetched).await;
    assert_eq!(body["limit"]["rate"], 5.0);
    assert_eq!(body["limit"]["capacity"], 6.0);
}

#[tokio::test]
async fn update_missing_client_is_not_found() {
    let state = admin_state().await;
    let response = update(State(state), Path("ghost".to_string()), Ok(request("", 1.0, 1.0))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_rejects_mismatched_client_id() {
    let state = admin_state().await;
    create(State(state.clone()), Ok(request("c1", 1.0, 1.0))).await;

    let response = update(State(state), Path("c1".to_string()), Ok(request("c2", 2.0, 2.0))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_removes_then_reports_not_found() {
    let state = admin_state().await;
    create(State(state.clone()), Ok(request("c1", 1.0, 1.0))).await;

    let response = remove(State(state.clone()), Path("c1".to_string())).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = remove(State(state), Path("c1".to_string())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_is_not_implemented() {
    let state = admin_state().await;
    let response = list(State(state)).await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn admin_surface_requires_a_store() {
    let state = storeless_state();

    let response = create(State(state.clone()), Ok(request("c1", 1.0, 1.0))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = get_one(State(state.clone()), Path("c1".to_string())).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = remove(State(state), Path("c1".to_string())).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
