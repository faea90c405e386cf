use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{GeminiConfig, ModelParams};
use crate::itinerary::{ConversationTurn, TurnRole};

/// Failure surfaced by the generative service. The itinerary session
/// collapses all variants into a single failed state, keeping the detail
/// text for display.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("service error: {0}")]
    Api(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// One-shot generation from a single prompt.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    /// Multi-turn continuation: `history` is the prior conversation in
    /// order, `message` the new user turn. An empty reply body in a
    /// successful response is returned as `Ok("")`; the caller decides
    /// what empty means.
    async fn chat(&self, history: &[ConversationTurn], message: &str) -> Result<String, GenerationError>;
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    params: ModelParams,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'a str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            params: config.params.clone(),
        }
    }

    fn role_str(role: TurnRole) -> &'static str {
        match role {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }

    async fn generate_content(&self, contents: Vec<GeminiContent<'_>>) -> Result<String, GenerationError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = GenerateContentRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: self.params.temperature,
                max_output_tokens: self.params.max_tokens,
                top_p: self.params.top_p,
            },
        };
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GenerationError::Auth(format!("status {status}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::Quota(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(GenerationError::Api(format!("status {status}")));
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(text)
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let contents = vec![GeminiContent { role: "user", parts: vec![GeminiPart { text: prompt }] }];
        self.generate_content(contents).await
    }

    async fn chat(&self, history: &[ConversationTurn], message: &str) -> Result<String, GenerationError> {
        let mut contents: Vec<GeminiContent<'_>> = history
            .iter()
            .map(|turn| GeminiContent {
                role: Self::role_str(turn.role),
                parts: vec![GeminiPart { text: &turn.text }],
            })
            .collect();
        contents.push(GeminiContent { role: "user", parts: vec![GeminiPart { text: message }] });
        self.generate_content(contents).await
    }
}
