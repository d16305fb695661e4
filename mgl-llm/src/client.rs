//! LLM Client: unified interface for Ollama and OpenAI-compatible backends.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::types::{LlmRequest, LlmResponse};

/// How many prior turns are folded into a completion-style prompt.
const HISTORY_WINDOW: usize = 8;
/// Linear backoff step between retries.
const RETRY_BACKOFF_MS: u64 = 250;

/// Provider backend for LLM inference.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    /// Ollama running locally (recommended).
    Ollama { base_url: String },
    /// OpenAI-compatible API (also works with Together, vLLM, LM Studio, etc.).
    OpenAiCompatible { base_url: String, api_key: String },
    /// No LLM available; all calls return error, triggering caller fallbacks.
    None,
}

/// The main LLM client that routes requests to the configured backend.
pub struct LlmClient {
    provider: LlmProvider,
    http: Client,
    model: String,
    max_retries: u32,
    timeout_ms: u64,
    max_tokens: u32,
    temperature: f32,
}

impl LlmClient {
    /// Create a new LLM client.
    #[must_use]
    pub fn new(provider: LlmProvider, model: impl Into<String>, max_retries: u32) -> Self {
        Self {
            provider,
            http: Client::new(),
            model: model.into(),
            max_retries,
            timeout_ms: 30_000,
            max_tokens: 512,
            temperature: 0.2,
        }
    }

    /// Override the sampling settings used by [`LlmClient::request`].
    #[must_use]
    pub fn with_request_defaults(mut self, timeout_ms: u64, max_tokens: u32, temperature: f32) -> Self {
        self.timeout_ms = timeout_ms;
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Build a request carrying this client's default sampling settings.
    #[must_use]
    pub fn request(&self, system: impl Into<String>, user: impl Into<String>) -> LlmRequest {
        LlmRequest::new(system, user)
            .with_timeout(self.timeout_ms)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
    }

    /// Create a client with no LLM backend (all calls fail → caller fallback).
    #[must_use]
    pub fn none() -> Self {
        Self {
            provider: LlmProvider::None,
            http: Client::new(),
            model: String::new(),
            max_retries: 0,
            timeout_ms: 0,
            max_tokens: 0,
            temperature: 0.0,
        }
    }

    /// Generate a response from the LLM.
    ///
    /// Returns `Err` if the LLM is unavailable or all retries fail.
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match &self.provider {
            LlmProvider::None => Err(LlmError::Unavailable("No LLM provider configured".into())),
            LlmProvider::Ollama { base_url } => self.generate_ollama(base_url, request).await,
            LlmProvider::OpenAiCompatible { base_url, api_key } => {
                self.generate_openai(base_url, api_key, request).await
            }
        }
    }

    /// Probe the backend. Ollama answers `GET /api/tags`; other providers
    /// are assumed reachable until a call fails.
    pub async fn health_check(&self) -> bool {
        match &self.provider {
            LlmProvider::None => false,
            LlmProvider::OpenAiCompatible { .. } => true,
            LlmProvider::Ollama { base_url } => {
                let url = format!("{base_url}/api/tags");
                match self
                    .http
                    .get(&url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(error = %e, "Ollama health check failed");
                        false
                    }
                }
            }
        }
    }

    /// Generate using Ollama's completion API.
    ///
    /// History is flattened into `role: content` lines, the way a plain
    /// completion model expects a transcript.
    async fn generate_ollama(
        &self,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{base_url}/api/generate");
        let body = json!({
            "model": self.model,
            "system": request.system,
            "prompt": completion_prompt(request),
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });

        let (json, latency_ms) = self.post_with_retries(&url, &body, None, request.timeout_ms).await?;

        let text = json["response"].as_str().unwrap_or_default().to_string();
        Ok(LlmResponse {
            text,
            tokens_generated: u32::try_from(json["eval_count"].as_u64().unwrap_or(0)).unwrap_or(u32::MAX),
            latency_ms,
            model: self.model.clone(),
        })
    }

    /// Generate using an OpenAI-compatible chat completions API.
    async fn generate_openai(
        &self,
        base_url: &str,
        api_key: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{base_url}/v1/chat/completions");

        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        let skip = request.history.len().saturating_sub(HISTORY_WINDOW);
        for turn in request.history.iter().skip(skip) {
            messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let (json, latency_ms) = self
            .post_with_retries(&url, &body, Some(api_key), request.timeout_ms)
            .await?;

        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(LlmResponse {
            text,
            tokens_generated: u32::try_from(tokens).unwrap_or(u32::MAX),
            latency_ms,
            model: self.model.clone(),
        })
    }

    /// POST a JSON body, retrying non-success responses and transport errors.
    async fn post_with_retries(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
        timeout_ms: u64,
    ) -> Result<(serde_json::Value, u64), LlmError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
                debug!(
                    "Retrying LLM call (attempt {}/{})",
                    attempt + 1,
                    self.max_retries + 1
                );
            }

            let start = Instant::now();
            let mut builder = self
                .http
                .post(url)
                .json(body)
                .timeout(Duration::from_millis(timeout_ms));
            if let Some(key) = bearer {
                builder = builder.header("Authorization", format!("Bearer {key}"));
            }

            match builder.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    let json: serde_json::Value = resp
                        .json()
                        .await
                        .map_err(|e| LlmError::ParseError(e.to_string()))?;
                    return Ok((json, latency_ms));
                }
                Ok(resp) => {
                    last_error = format!(
                        "HTTP {}: {}",
                        resp.status(),
                        resp.text().await.unwrap_or_default()
                    );
                    warn!(url, "LLM backend returned error: {}", last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() {
                        warn!(url, "LLM request timed out after {}ms", timeout_ms);
                    } else {
                        warn!(url, "LLM request failed: {}", last_error);
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }

    /// Check if the LLM client has a backend configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.provider, LlmProvider::None)
    }

    /// The model name requests are sent to.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Fold the last few turns of history and the user prompt into a single
/// completion prompt ending with an open assistant turn.
fn completion_prompt(request: &LlmRequest) -> String {
    let skip = request.history.len().saturating_sub(HISTORY_WINDOW);
    let mut prompt = String::new();
    for turn in request.history.iter().skip(skip) {
        prompt.push_str(turn.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("user: ");
    prompt.push_str(&request.user);
    prompt.push_str("\nassistant:");
    prompt
}
