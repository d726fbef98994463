//! Gemini `generateContent` backend
//!
//! Implements [`GenerativeModel`] over the Generative Language REST API with
//! `reqwest`. The key travels in the `x-goog-api-key` header, never in the
//! URL, so it cannot leak into request logs.

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::analysis::GenerativeModel;
use crate::config::AnalysisConfig;
use crate::errors::AnalysisError;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP client for one configured model
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

/// One entry from the model listing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

impl GeminiClient {
    /// Build a client for the configured model and API base
    ///
    /// # Errors
    ///
    /// - `Unavailable` if the HTTP client cannot be constructed
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.timeout())
            .build()
            .map_err(|e| AnalysisError::Unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
        })
    }

    fn generate_url(&self) -> String {
        let model = self.model.trim_start_matches("models/");
        format!("{}/v1beta/models/{model}:generateContent", self.api_base)
    }

    /// List models that support `generateContent`
    pub async fn list_models(&self, api_key: &SecretString) -> Result<Vec<ModelEntry>, AnalysisError> {
        let response = self
            .http
            .get(format!("{}/v1beta/models", self.api_base))
            .header(API_KEY_HEADER, api_key.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let list: ModelList = serde_json::from_str(&body).map_err(|e| AnalysisError::Upstream {
            status: status.as_u16(),
            detail: format!("unreadable model list: {e}"),
        })?;
        Ok(list
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .collect())
    }
}

impl GenerativeModel for GeminiClient {
    async fn generate(&self, api_key: &SecretString, prompt: &str) -> Result<String, AnalysisError> {
        let request = GenerateRequest {
            contents: [RequestContent {
                parts: [RequestPart { text: prompt }],
            }],
        };
        let response = self
            .http
            .post(self.generate_url())
            .header(API_KEY_HEADER, api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        extract_text(&body)
    }
}

fn transport_error(err: reqwest::Error) -> AnalysisError {
    if err.is_timeout() {
        AnalysisError::Timeout(err.to_string())
    } else {
        AnalysisError::Transport(err.to_string())
    }
}

/// Map a non-success response to an error carrying the upstream detail
///
/// The API answers a bad key with 400 `INVALID_ARGUMENT`, so the message is
/// inspected as well as the status.
fn classify_status(status: StatusCode, body: &str) -> AnalysisError {
    let (detail, upstream_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (env.error.message, env.error.status),
        Err(_) => (body.trim().chars().take(500).collect(), String::new()),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnalysisError::AuthRejected(detail),
        StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited(detail),
        StatusCode::BAD_REQUEST if detail.contains("API key") => AnalysisError::AuthRejected(detail),
        _ if upstream_status == "RESOURCE_EXHAUSTED" => AnalysisError::RateLimited(detail),
        _ => AnalysisError::Upstream {
            status: status.as_u16(),
            detail,
        },
    }
}

/// Concatenate the text parts of the first candidate
fn extract_text(body: &str) -> Result<String, AnalysisError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| AnalysisError::Upstream {
            status: 200,
            detail: format!("unreadable response: {e}"),
        })?;
    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        return Err(AnalysisError::EmptyResponse);
    }
    Ok(text)
}
