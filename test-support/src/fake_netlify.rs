use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

pub const ENV_PATH: &str = "/api/v1/accounts/-/env";
pub const BLOBS_PATH: &str = "/api/v1/blobs";
pub const BUILD_HOOKS_PATH: &str = "/build_hooks";

/// Stand-in for the parts of the Netlify API used by the backend: site environment variables,
/// blob stores and build hooks.
#[derive(Clone)]
pub struct FakeNetlify {
    site_id: Cow<'static, str>,
    required_token: Cow<'static, str>,
    state: Arc<Mutex<NetlifyState>>,
}

#[derive(Default)]
struct NetlifyState {
    env: BTreeMap<String, String>,
    blobs: BTreeMap<(String, String), String>,
    build_hook_calls: Vec<String>,
    env_patches: usize,
    unavailable: bool,
    fail_build_hooks: bool,
}

#[derive(Deserialize)]
struct SiteQuery {
    site_id: String,
}

#[derive(Deserialize)]
struct PatchPayload {
    values: Vec<PatchValue>,
}

#[derive(Deserialize)]
struct PatchValue {
    value: String,
}

impl FakeNetlify {
    pub fn new(
        site_id: impl Into<Cow<'static, str>>,
        required_token: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            required_token: required_token.into(),
            state: Default::default(),
        }
    }

    pub fn with_env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.lock().unwrap().env.insert(key.into(), value.into());
        self
    }

    pub fn with_blob(
        self,
        store: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((store.into(), key.into()), value.into());
        self
    }

    pub fn fail_build_hooks(self) -> Self {
        self.state.lock().unwrap().fail_build_hooks = true;
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn env_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().env.get(key).cloned()
    }

    pub fn env_patches(&self) -> usize {
        self.state.lock().unwrap().env_patches
    }

    pub fn blob(&self, store: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(&(store.to_string(), key.to_string()))
            .cloned()
    }

    pub fn blob_keys(&self, store: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .keys()
            .filter(|(s, _)| s == store)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn build_hook_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().build_hook_calls.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(ENV_PATH, get(list_env))
            .route(&format!("{ENV_PATH}/:key"), patch(patch_env))
            .route(&format!("{BLOBS_PATH}/:site/:store"), get(list_blobs))
            .route(
                &format!("{BLOBS_PATH}/:site/:store/:key"),
                get(get_blob).put(put_blob).delete(delete_blob),
            )
            .route(&format!("{BUILD_HOOKS_PATH}/:id"), post(trigger_build_hook))
            .with_state(self.clone())
    }

    fn check_request(&self, headers: &HeaderMap, site_id: &str) -> Result<(), Response> {
        if self.state.lock().unwrap().unavailable {
            return Err((StatusCode::SERVICE_UNAVAILABLE, "Service unavailable").into_response());
        }
        let expected = format!("Bearer {}", self.required_token);
        let authorization = headers.get("Authorization").and_then(|v| v.to_str().ok());
        if authorization != Some(expected.as_str()) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"code": 401, "message": "Access Denied"})),
            )
                .into_response());
        }
        if site_id != self.site_id {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({"code": 404, "message": "Not Found"})),
            )
                .into_response());
        }
        Ok(())
    }
}

async fn list_env(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Query(query): Query<SiteQuery>,
) -> Response {
    if let Err(response) = state.check_request(&headers, &query.site_id) {
        return response;
    }
    let env = state.state.lock().unwrap().env.clone();
    let body: Vec<Value> = env
        .into_iter()
        .map(|(key, value)| {
            json!({
                "key": key,
                "scopes": ["builds", "functions", "runtime", "post_processing"],
                "values": [{"id": format!("{key}-all"), "value": value, "context": "all"}],
            })
        })
        .collect();
    Json(body).into_response()
}

async fn patch_env(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Query(query): Query<SiteQuery>,
    Json(payload): Json<PatchPayload>,
) -> Response {
    if let Err(response) = state.check_request(&headers, &query.site_id) {
        return response;
    }
    let Some(value) = payload.values.into_iter().next() else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Missing values").into_response();
    };
    let mut inner = state.state.lock().unwrap();
    inner.env.insert(key.clone(), value.value.clone());
    inner.env_patches += 1;
    Json(json!({"key": key, "values": [{"value": value.value, "context": "all"}]})).into_response()
}

async fn list_blobs(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Path((site, store)): Path<(String, String)>,
) -> Response {
    if let Err(response) = state.check_request(&headers, &site) {
        return response;
    }
    let blobs: Vec<Value> = state
        .blob_keys(&store)
        .into_iter()
        .map(|key| json!({"key": key, "etag": "\"fake\""}))
        .collect();
    Json(json!({"blobs": blobs, "directories": []})).into_response()
}

async fn get_blob(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Path((site, store, key)): Path<(String, String, String)>,
) -> Response {
    if let Err(response) = state.check_request(&headers, &site) {
        return response;
    }
    match state.blob(&store, &key) {
        Some(value) => value.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_blob(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Path((site, store, key)): Path<(String, String, String)>,
    body: String,
) -> Response {
    if let Err(response) = state.check_request(&headers, &site) {
        return response;
    }
    state.state.lock().unwrap().blobs.insert((store, key), body);
    StatusCode::OK.into_response()
}

async fn delete_blob(
    State(state): State<FakeNetlify>,
    headers: HeaderMap,
    Path((site, store, key)): Path<(String, String, String)>,
) -> Response {
    if let Err(response) = state.check_request(&headers, &site) {
        return response;
    }
    state.state.lock().unwrap().blobs.remove(&(store, key));
    StatusCode::NO_CONTENT.into_response()
}

async fn trigger_build_hook(State(state): State<FakeNetlify>, Path(id): Path<String>) -> Response {
    let mut inner = state.state.lock().unwrap();
    if inner.fail_build_hooks || inner.unavailable {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Build hook failed").into_response();
    }
    inner.build_hook_calls.push(id);
    StatusCode::OK.into_response()
}
