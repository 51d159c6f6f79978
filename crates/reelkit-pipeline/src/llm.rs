//! Optional LLM client for structured-output calls.
//!
//! Used only for transcript span splitting, span-to-word mapping and image
//! keyword extraction. Every call site pairs the response with a
//! deterministic validator or repairer, so the pipeline stays correct with
//! the client disabled or failing.

use reqwest::Client;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::settings::AiSettings;

/// Chat-completions request shape (OpenAI-compatible endpoints).
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Structured-output LLM client.
pub struct LlmClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

impl LlmClient {
    /// Build a client when the AI group is enabled and fully configured.
    pub fn from_settings(ai: &AiSettings) -> Option<Self> {
        if !ai.enabled {
            return None;
        }
        let endpoint = ai.endpoint.clone()?;
        let api_key = ai.api_key.clone()?;
        Some(Self {
            endpoint,
            api_key,
            model: ai.model.clone(),
            client: Client::new(),
        })
    }

    /// Run a structured-output call: the response must be a JSON object
    /// matching `T`'s schema, which is embedded in the prompt.
    pub async fn structured<T>(&self, system: &str, prompt: &str) -> PipelineResult<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = serde_json::to_string(&schema_for!(T)).unwrap_or_default();
        let full_prompt = format!(
            "{prompt}\n\nRespond with a single JSON object matching this JSON schema, \
             with no surrounding prose:\n{schema}"
        );

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: full_prompt,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            temperature: 0.2,
        };

        debug!(model = %self.model, "sending structured LLM request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| llm_err("LLM request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::new(
                "llm",
                ErrorKind::Processing,
                format!("LLM endpoint returned {status}"),
            ));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| llm_err("LLM response was not valid JSON", e))?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| {
                PipelineError::new("llm", ErrorKind::Processing, "LLM returned no choices")
            })?;

        serde_json::from_str(strip_fences(content)).map_err(|e| {
            warn!("LLM structured output failed to parse: {}", e);
            llm_err("LLM output did not match the requested schema", e)
        })
    }
}

fn llm_err(message: &str, source: impl std::error::Error + Send + Sync + 'static) -> PipelineError {
    PipelineError::with_source("llm", ErrorKind::Processing, message.to_string(), source)
}

/// Some models wrap JSON in markdown fences despite instructions.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
