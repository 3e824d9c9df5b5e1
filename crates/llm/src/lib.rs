//! Provider-polymorphic LLM client.
//!
//! A tagged variant over the three supported providers — no dynamic
//! dispatch, no `Auto` variant at this layer. Resolving the configuration
//! token `"auto"` into one of the three concrete providers is the Config
//! Store's job (see `rune-config::LlmConfig::resolve`); by the time a
//! [`LlmClient`] is constructed, the provider is already fixed.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("not available")]
    NotAvailable,
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned an unparsable response: {0}")]
    InvalidResponse(String),
}

/// Per-call options for [`LlmClient::generate`]. All fields are optional;
/// absent values fall back to the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
    pub temperature: Option<f32>,
}

impl GenerateOptions {
    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Default::default()
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, Clone)]
struct AnthropicClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
struct OpenAiClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
struct GoogleClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
    /// Session cache keyed by a hash of the system prompt: the system prompt
    /// is attached at model-instance construction, and instances are cached
    /// by that hash. There is no local SDK session object to reuse over a
    /// plain REST transport, so the cache just tracks which system-prompt
    /// identities have already been "constructed" (first use)
    /// without fabricating a stateful handle that does not exist.
    sessions: std::sync::Arc<Mutex<HashMap<u64, ()>>>,
}

enum ProviderImpl {
    Anthropic(AnthropicClient),
    OpenAi(OpenAiClient),
    Google(GoogleClient),
}

/// A constructed LLM client for one of the three known providers. Carries
/// its own `available` flag so callers can check [`LlmClient::is_available`]
/// before calling [`LlmClient::generate`] rather than handling a thrown
/// error on every call site.
pub struct LlmClient {
    provider: ProviderImpl,
    available: bool,
}

impl LlmClient {
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let available = !api_key.trim().is_empty();
        if !available {
            tracing::info!("anthropic client constructed without an API key; generate() will report not available");
        }
        Self {
            provider: ProviderImpl::Anthropic(AnthropicClient {
                api_key,
                model: model.into(),
                http: reqwest::Client::new(),
            }),
            available,
        }
    }

    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let available = !api_key.trim().is_empty();
        if !available {
            tracing::info!("openai client constructed without an API key; generate() will report not available");
        }
        Self {
            provider: ProviderImpl::OpenAi(OpenAiClient {
                api_key,
                model: model.into(),
                http: reqwest::Client::new(),
            }),
            available,
        }
    }

    pub fn google(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let available = !api_key.trim().is_empty();
        if !available {
            tracing::info!("google client constructed without an API key; generate() will report not available");
        }
        Self {
            provider: ProviderImpl::Google(GoogleClient {
                api_key,
                model: model.into(),
                http: reqwest::Client::new(),
                sessions: std::sync::Arc::new(Mutex::new(HashMap::new())),
            }),
            available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// `generate(prompt, system, max_tokens, timeout, temperature) -> text`.
    /// Returns the raw provider text; JSON parsing of that
    /// text is the caller's responsibility via [`parse_llm_json`].
    pub async fn generate(&self, prompt: &str, opts: GenerateOptions) -> Result<String, LlmError> {
        if !self.available {
            return Err(LlmError::NotAvailable);
        }

        let timeout = opts.timeout();
        match &self.provider {
            ProviderImpl::Anthropic(c) => c.generate(prompt, &opts, timeout).await,
            ProviderImpl::OpenAi(c) => c.generate(prompt, &opts, timeout).await,
            ProviderImpl::Google(c) => c.generate(prompt, &opts, timeout).await,
        }
    }
}

impl AnthropicClient {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions, timeout: Duration) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": opts.max_tokens.unwrap_or(1024),
            "system": opts.system.clone().unwrap_or_default(),
            "temperature": opts.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(map_reqwest_err)?;
        if !status.is_success() {
            return Err(LlmError::Transport(format!("anthropic error ({status}): {body}")));
        }

        body.get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse(body.to_string()))
    }
}

impl OpenAiClient {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions, timeout: Duration) -> Result<String, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = &opts.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(max_tokens) = opts.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = opts.temperature {
            payload["temperature"] = json!(temperature);
        }

        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(map_reqwest_err)?;
        if !status.is_success() {
            return Err(LlmError::Transport(format!("openai error ({status}): {body}")));
        }

        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse(body.to_string()))
    }
}

impl GoogleClient {
    fn touch_session(&self, system: Option<&str>) {
        let mut hasher = DefaultHasher::new();
        system.unwrap_or("").hash(&mut hasher);
        let key = hasher.finish();
        self.sessions.lock().unwrap().entry(key).or_insert(());
    }

    async fn generate(&self, prompt: &str, opts: &GenerateOptions, timeout: Duration) -> Result<String, LlmError> {
        self.touch_session(opts.system.as_deref());

        let mut payload = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        if let Some(system) = &opts.system {
            payload["system_instruction"] = json!({ "parts": [{ "text": system }] });
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = opts.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = opts.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(map_reqwest_err)?;
        if !status.is_success() {
            return Err(LlmError::Transport(format!("google error ({status}): {body}")));
        }

        body.get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse(body.to_string()))
    }
}

fn map_reqwest_err(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(err.to_string())
    }
}

/// `parse_llm_json(raw)`: strip leading/trailing fenced code
/// block markers (and an optional `json` tag), try to parse; on failure
/// locate the first `{` and the last `}` and try again; on failure return
/// an empty object. Shared by Tier-2, Tier-3, and the Query Processor.
pub fn parse_llm_json(raw: &str) -> Value {
    if let Some(fenced) = extract_fenced_json(raw) {
        return fenced;
    }
    if let Some(bare) = extract_bare_json(raw) {
        return bare;
    }
    Value::Object(serde_json::Map::new())
}

/// Typed variant of [`parse_llm_json`] for callers that want a concrete
/// struct rather than a loose [`Value`]. Returns `None` rather than a
/// default value on total failure so callers can apply their own
/// degrade-gracefully policy (Tier-2 fail-open, Tier-3 minimal record).
pub fn parse_llm_json_as<T: DeserializeOwned>(raw: &str) -> Option<T> {
    if let Some(fenced) = extract_fenced_json(raw) {
        if let Ok(v) = serde_json::from_value(fenced) {
            return Some(v);
        }
    }
    if let Some(bare) = extract_bare_json(raw) {
        if let Ok(v) = serde_json::from_value(bare) {
            return Some(v);
        }
    }
    None
}

fn extract_fenced_json(response: &str) -> Option<Value> {
    let fence_start = response.find("```")?;
    let after_fence = &response[fence_start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let json_start = after_fence.find(|c: char| !c.is_whitespace())?;
    let json_body = &after_fence[json_start..];
    let fence_end = json_body.find("```")?;
    let json_str = json_body[..fence_end].trim();
    serde_json::from_str(json_str).ok()
}

fn extract_bare_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_not_available() {
        let client = LlmClient::anthropic("", "claude-3-5-sonnet-latest");
        assert!(!client.is_available());
    }

    #[test]
    fn present_api_key_is_available() {
        let client = LlmClient::openai("sk-test", "gpt-4o-mini");
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn generate_fails_when_not_available() {
        let client = LlmClient::google("", "gemini-1.5-pro");
        let err = client.generate("hello", GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::NotAvailable));
    }

    #[test]
    fn parse_llm_json_strips_fence() {
        let raw = "```json\n{\"capture\": true, \"reason\": \"ok\"}\n```";
        let value = parse_llm_json(raw);
        assert_eq!(value["capture"], true);
        assert_eq!(value["reason"], "ok");
    }

    #[test]
    fn parse_llm_json_finds_bare_object() {
        let raw = "Sure, here you go: {\"capture\": false} thanks!";
        let value = parse_llm_json(raw);
        assert_eq!(value["capture"], false);
    }

    #[test]
    fn parse_llm_json_returns_empty_object_on_failure() {
        let value = parse_llm_json("not json at all");
        assert_eq!(value, Value::Object(serde_json::Map::new()));
    }

    #[test]
    fn parse_llm_json_fenced_takes_precedence() {
        let raw = "Bare: {\"capture\": false}\n```json\n{\"capture\": true}\n```";
        let value = parse_llm_json(raw);
        assert_eq!(value["capture"], true);
    }

    #[derive(serde::Deserialize)]
    struct Decision {
        capture: bool,
        reason: String,
    }

    #[test]
    fn parse_llm_json_as_typed_struct() {
        let raw = "```json\n{\"capture\":true,\"reason\":\"strong match\"}\n```";
        let decision: Decision = parse_llm_json_as(raw).unwrap();
        assert!(decision.capture);
        assert_eq!(decision.reason, "strong match");
    }

    #[test]
    fn parse_llm_json_as_returns_none_on_failure() {
        let out: Option<Decision> = parse_llm_json_as("nothing useful here");
        assert!(out.is_none());
    }
}
