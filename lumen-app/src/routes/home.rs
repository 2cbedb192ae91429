use axum::Json;
use axum::routing::get;

pub const ROOT_BANNER: &str = "lumen gateway is running";

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/", get(get_root))
        .route("/api/hello", get(get_hello))
}

async fn get_root() -> &'static str {
    ROOT_BANNER
}

async fn get_hello() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Hello from lumen!" }))
}
