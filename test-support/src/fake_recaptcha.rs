use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub const VERIFY_PATH: &str = "/recaptcha/api/siteverify";

#[derive(Clone)]
pub struct FakeRecaptcha {
    required_secret: Cow<'static, str>,
    required_solution: Option<String>,
    return_invalid_response: bool,
    calls: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct VerifyRequestPayload {
    secret: String,
    response: String,
    #[allow(unused)]
    remoteip: Option<String>,
}

#[derive(Serialize)]
struct VerifyResponsePayload {
    success: bool,
    #[serde(rename = "error-codes")]
    error_codes: Vec<String>,
}

impl FakeRecaptcha {
    pub fn new(required_secret: impl Into<Cow<'static, str>>) -> Self {
        Self {
            required_secret: required_secret.into(),
            required_solution: None,
            return_invalid_response: false,
            calls: Default::default(),
        }
    }

    pub fn require_solution(self, required_solution: impl AsRef<str>) -> Self {
        Self {
            required_solution: Some(required_solution.as_ref().into()),
            ..self
        }
    }

    pub fn return_invalid_response(self) -> Self {
        Self {
            return_invalid_response: true,
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(VERIFY_PATH, post(verify))
            .with_state(self.clone())
    }
}

async fn verify(
    State(state): State<FakeRecaptcha>,
    Form(payload): Form<VerifyRequestPayload>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    if state.return_invalid_response {
        (StatusCode::OK, "Invalid response").into_response()
    } else if payload.secret != state.required_secret {
        Json(VerifyResponsePayload {
            success: false,
            error_codes: vec!["invalid-input-secret".into()],
        })
        .into_response()
    } else if state
        .required_solution
        .as_ref()
        .is_some_and(|solution| *solution != payload.response)
    {
        Json(VerifyResponsePayload {
            success: false,
            error_codes: vec!["invalid-input-response".into()],
        })
        .into_response()
    } else {
        Json(VerifyResponsePayload {
            success: true,
            error_codes: vec![],
        })
        .into_response()
    }
}
