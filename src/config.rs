use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

impl ModelParams {
    pub fn from_env() -> Self {
        Self {
            temperature: parse_env("GEMINI_TEMPERATURE"),
            max_tokens: parse_env("GEMINI_MAX_TOKENS"),
            top_p: parse_env("GEMINI_TOP_P"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub params: ModelParams,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".into());
        let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into());
        Self { base_url, api_key, model, params: ModelParams::from_env() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self { database_url: std::env::var("TRIPBOOK_DB_URL").ok() }
    }
}
