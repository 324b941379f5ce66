use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
};

pub const SEND_PATH: &str = "/v3/smtp/email";

/// Stand-in for the Brevo transactional email endpoint. Accepted payloads are recorded verbatim.
#[derive(Clone)]
pub struct FakeBrevo {
    required_api_key: Cow<'static, str>,
    fail_with_status: Option<u16>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeBrevo {
    pub fn new(required_api_key: impl Into<Cow<'static, str>>) -> Self {
        Self {
            required_api_key: required_api_key.into(),
            fail_with_status: None,
            received: Default::default(),
        }
    }

    pub fn fail_with_status(self, status: u16) -> Self {
        Self {
            fail_with_status: Some(status),
            ..self
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(SEND_PATH, post(send))
            .with_state(self.clone())
    }
}

async fn send(
    State(state): State<FakeBrevo>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let api_key = headers.get("api-key").and_then(|v| v.to_str().ok());
    if api_key != Some(state.required_api_key.as_ref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": "unauthorized", "message": "Key not found"})),
        )
            .into_response();
    }
    if let Some(status) = state.fail_with_status {
        return (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({"code": "failure", "message": "Sending failed"})),
        )
            .into_response();
    }
    let mut received = state.received.lock().unwrap();
    received.push(payload);
    let message_id = format!("<{}@fake-brevo.test>", received.len());
    (StatusCode::CREATED, Json(json!({ "messageId": message_id }))).into_response()
}
