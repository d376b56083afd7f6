//! LLM generation client abstraction
//!
//! Provides a unified interface over the generation backend:
//! - Ollama-compatible `/api/generate` endpoint
//! - Offline client for running purely on heuristic fallbacks
//!
//! Model names are configuration; callers only pick a [`ModelProfile`].

mod json;

pub use json::{decode_json_object, extract_json_object, null_as_default};

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Which configured model a request should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    General,
    Code,
}

/// A single non-streaming generation request
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub profile: ModelProfile,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn new(profile: ModelProfile, prompt: impl Into<String>) -> Self {
        Self {
            profile,
            prompt: prompt.into(),
            temperature: 0.1,
            max_tokens: 512,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Trait for text generation
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion and return the raw response text
    async fn generate(&self, request: &GenerateRequest) -> Result<String>;

    /// Resolve the model name used for a profile
    fn model_for(&self, profile: ModelProfile) -> &str;
}

/// Ollama-compatible generation client
pub struct OllamaClient {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    /// Create a new client for the configured endpoint
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    async fn make_request(&self, model: &str, request: &GenerateRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));

        let body = OllamaRequest {
            model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::LlmStatus { status, body });
        }

        let result: OllamaResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                AppError::MalformedResponse {
                    message: format!("Failed to parse generate response: {}", e),
                }
            }
        })?;

        Ok(result.response)
    }

    fn transport_error(&self, err: reqwest::Error) -> AppError {
        if err.is_timeout() {
            AppError::LlmTimeout {
                timeout_ms: self.config.timeout().as_millis() as u64,
            }
        } else {
            AppError::LlmUnavailable {
                message: format!("Request to {} failed: {}", self.config.endpoint, err),
            }
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let model = self.model_for(request.profile).to_string();
        let start = Instant::now();

        let result = self.make_request(&model, request).await;
        metrics::record_llm(start.elapsed().as_secs_f64(), &model, result.is_ok());

        if let Err(e) = &result {
            tracing::warn!(model = %model, error = %e, "LLM generation failed");
        }

        result
    }

    fn model_for(&self, profile: ModelProfile) -> &str {
        match profile {
            ModelProfile::General => &self.config.general_model,
            ModelProfile::Code => &self.config.code_model,
        }
    }
}

/// Client that is always unavailable; every stage takes its heuristic path
pub struct OfflineLlm;

#[async_trait]
impl LlmClient for OfflineLlm {
    async fn generate(&self, _request: &GenerateRequest) -> Result<String> {
        Err(AppError::LlmUnavailable {
            message: "LLM backend disabled".to_string(),
        })
    }

    fn model_for(&self, _profile: ModelProfile) -> &str {
        "offline"
    }
}

/// Create an LLM client based on configuration
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    if !config.enabled {
        tracing::warn!("LLM backend disabled, using heuristic fallbacks only");
        return Ok(Arc::new(OfflineLlm));
    }

    Ok(Arc::new(OllamaClient::new(config.clone())?))
}
