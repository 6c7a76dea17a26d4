#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;

use study_backend::db::AggregateStore;
use study_backend::state::AppState;

pub async fn create_test_store() -> AggregateStore {
    AggregateStore::in_memory()
        .await
        .expect("in-memory aggregate store")
}

pub async fn create_test_app() -> Router {
    create_app_with_store(create_test_store().await)
}

pub fn create_app_with_store(store: AggregateStore) -> Router {
    study_backend::create_app(AppState::new(store))
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
