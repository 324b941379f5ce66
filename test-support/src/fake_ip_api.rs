use axum::{extract::Path, routing::get, Json, Router};
use serde_json::{json, Value};

pub const LOOKUP_PATH: &str = "/json/:ip";

/// Answers every lookup with the same fixed location.
pub struct FakeIpApi;

impl FakeIpApi {
    pub fn router() -> Router {
        Router::new().route(LOOKUP_PATH, get(lookup))
    }
}

async fn lookup(Path(ip): Path<String>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "query": ip,
        "country": "Kenya",
        "city": "Nairobi",
        "isp": "Example Telecom",
        "proxy": false,
        "hosting": true,
    }))
}
