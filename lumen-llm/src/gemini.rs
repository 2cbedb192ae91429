use crate::error::{LlmError, Result};
use crate::types::ModelInfo;
use serde::{Deserialize, Serialize};

const GEMINI_API_VERSION: &str = "v1beta";
const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";
const GEMINI_LIST_PAGE_SIZE: &str = "1000";

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.trim_start_matches("models/").to_string(),
        }
    }

    fn models_url(&self) -> String {
        format!("{}/{}/models", self.base_url, GEMINI_API_VERSION)
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/{}:{}", self.models_url(), self.model, action)
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn generate_content(&self, prompt: &str) -> Result<String> {
        let req = GenerateContentRequest::user_text(prompt);

        let response = self
            .http
            .post(self.action_url("generateContent"))
            .header(GEMINI_API_KEY_HEADER, &self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(provider_error("generateContent", status, &body));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)?;
        parsed.into_text()
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", GEMINI_LIST_PAGE_SIZE.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let response = self
                .http
                .get(self.models_url())
                .header(GEMINI_API_KEY_HEADER, &self.api_key)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(provider_error("listModels", status, &body));
            }

            let page: ListModelsResponse = serde_json::from_str(&body)?;
            out.extend(page.models.into_iter().map(ModelInfo::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(model_count = out.len(), "listed models");
        Ok(out)
    }
}

fn provider_error(action: &str, status: reqwest::StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    LlmError::Invocation(format!("gemini {action} status={status}: {message}"))
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

impl<'a> GenerateContentRequest<'a> {
    fn user_text(prompt: &'a str) -> Self {
        Self {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn into_text(self) -> Result<String> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(LlmError::Invocation(format!(
                "gemini returned no candidates (block_reason={reason})"
            )));
        };

        let texts: Vec<String> = candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.text)
            .collect();
        if texts.is_empty() {
            let reason = candidate
                .finish_reason
                .unwrap_or_else(|| "unspecified".to_string());
            return Err(LlmError::Invocation(format!(
                "gemini candidate has no text (finish_reason={reason})"
            )));
        }
        Ok(texts.concat())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<GeminiModel>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl From<GeminiModel> for ModelInfo {
    fn from(m: GeminiModel) -> Self {
        Self {
            name: m.name,
            display_name: m.display_name,
            supported_generation_methods: m.supported_generation_methods,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}
