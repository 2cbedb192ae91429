use crate::error::ApiError;
use crate::server::AppContext;
use axum::body::Bytes;
use axum::routing::get;
use axum::{Extension, Json};
use lumen_llm::ModelRequest;
use serde::Deserialize;
use std::sync::Arc;

pub const MODEL_ROUTE: &str = "/test-gemini";

#[derive(Debug, Deserialize)]
struct PromptBody {
    #[serde(default)]
    prompt: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route(MODEL_ROUTE, get(test_model).post(test_model))
}

#[tracing::instrument(level = "info", skip_all)]
async fn test_model(
    Extension(ctx): Extension<Arc<AppContext>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Checked before anything else: no key, no network.
    let Some(key) = ctx.config.model_key.as_ref() else {
        return Err(ApiError::ConfigMissing("model API key not provided"));
    };

    let prompt = prompt_from_body(&body)?.unwrap_or_else(|| ctx.test_prompt.clone());
    let response = ctx
        .generator
        .generate(&ModelRequest::new(prompt), key.expose())
        .await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "text": response.text,
    })))
}

/// `Some` only for a JSON body carrying a non-blank `prompt`.
fn prompt_from_body(body: &[u8]) -> Result<Option<String>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let parsed: PromptBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
    Ok(parsed.prompt.filter(|p| !p.trim().is_empty()))
}
