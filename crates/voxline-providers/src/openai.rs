//! OpenAI Chat Completions language model.
//!
//! Streams `/v1/chat/completions` deltas. Also serves OpenRouter, Ollama and
//! other OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use voxline_core::config::{LlmConfig, ProviderConfig};
use voxline_core::context::{ConversationContext, Role};

use crate::sse::parse_sse_response;
use crate::{LanguageModel, ProviderError, TokenStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OPENROUTER_MODEL: &str = "openai/gpt-4o-mini";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

/// API style: determines auth and header differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl ApiStyle {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::OpenRouter => OPENROUTER_BASE_URL,
            Self::Ollama => OLLAMA_BASE_URL,
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => DEFAULT_OPENAI_MODEL,
            Self::OpenRouter => DEFAULT_OPENROUTER_MODEL,
            Self::Ollama => DEFAULT_OLLAMA_MODEL,
        }
    }
}

pub struct OpenAiLanguageModel {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl OpenAiLanguageModel {
    /// Build from a provider entry. Fails if the id is unknown or a key is required but absent.
    pub fn from_config(provider: &ProviderConfig, llm: &LlmConfig) -> Result<Self, ProviderError> {
        let api_style = ApiStyle::from_id(&provider.id).ok_or_else(|| {
            ProviderError::fatal(format!("'{}' is not an OpenAI-compatible provider", provider.id))
        })?;

        let api_key = provider.resolve_api_key();
        if api_key.is_none() && provider.requires_api_key() {
            return Err(ProviderError::missing_api_key(&provider.id));
        }

        Ok(Self {
            base_url: provider
                .base_url
                .as_deref()
                .unwrap_or(api_style.default_base_url())
                .trim_end_matches('/')
                .to_string(),
            api_style,
            provider_id: provider.id.clone(),
            model: provider
                .model
                .clone()
                .unwrap_or_else(|| api_style.default_model().to_string()),
            api_key,
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            client: reqwest::Client::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Map conversation turns to chat messages.
pub fn format_messages(context: &ConversationContext) -> Vec<serde_json::Value> {
    context
        .turns()
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": turn.content })
        })
        .collect()
}

/// Extract the text delta from one SSE `data:` payload.
///
/// `Ok(None)` means end of stream (`[DONE]`). Unparseable payloads and
/// content-less deltas yield `Ok(Some(""))` and are skipped by the caller.
fn parse_delta(data: &str) -> Result<Option<String>, ProviderError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            if let Ok(err) = serde_json::from_str::<serde_json::Value>(data) {
                if let Some(msg) = err.get("error").and_then(|e| e.get("message")) {
                    return Err(ProviderError::fatal(format!("stream error: {msg}")));
                }
            }
            trace!(%e, data, "Failed to parse chat completion chunk");
            return Ok(Some(String::new()));
        }
    };
    Ok(Some(
        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .unwrap_or_default(),
    ))
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(&self, context: &ConversationContext) -> Result<TokenStream, ProviderError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: format_messages(context),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(model = %body.model, base_url = %self.base_url, turns = context.len(), "Streaming chat completion");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        // Auth differs by style
        if self.api_style != ApiStyle::Ollama {
            if let Some(key) = &self.api_key {
                req_builder = req_builder.header("authorization", format!("Bearer {key}"));
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("HTTP-Referer", "https://voxline.dev");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.provider_id, status, &body));
        }

        let sse = Box::pin(parse_sse_response(response));
        let tokens = futures::stream::unfold(Some(sse), |state| async move {
            let mut sse = state?;
            loop {
                match sse.next().await {
                    Some(Ok(event)) => match parse_delta(&event.data) {
                        Ok(None) => return None,
                        Ok(Some(text)) if text.is_empty() => continue,
                        Ok(Some(text)) => return Some((Ok(text), Some(sse))),
                        Err(e) => return Some((Err(e), None)),
                    },
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => return None,
                }
            }
        });

        Ok(Box::pin(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages_maps_roles() {
        let mut ctx = ConversationContext::with_system_prompt("be brief");
        ctx.push_user("hello");
        ctx.push_assistant("hi there");

        let messages = format_messages(&ctx);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn test_parse_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_delta(data).unwrap(), Some("Hel".into()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), Some(String::new()));

        assert_eq!(parse_delta(" [DONE] ").unwrap(), None);
    }

    #[test]
    fn test_parse_delta_error_payload() {
        let data = r#"{"error":{"message":"context length exceeded"}}"#;
        assert!(matches!(parse_delta(data), Err(ProviderError::Fatal(_))));
    }

    #[test]
    fn test_from_config_defaults() {
        let mut provider = ProviderConfig::named("openai");
        provider.api_key = Some("sk-test".into());
        let llm = OpenAiLanguageModel::from_config(&provider, &LlmConfig::default()).unwrap();
        assert_eq!(llm.model(), "gpt-4o-mini");
        assert_eq!(llm.base_url, OPENAI_BASE_URL);
        assert_eq!(llm.id(), "openai");
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let mut provider = ProviderConfig::named("ollama");
        provider.base_url = Some("http://gpu-box:11434/".into());
        let llm = OpenAiLanguageModel::from_config(&provider, &LlmConfig::default()).unwrap();
        assert_eq!(llm.base_url, "http://gpu-box:11434");
        assert_eq!(llm.api_style, ApiStyle::Ollama);
    }

    #[test]
    fn test_unknown_id_rejected() {
        let provider = ProviderConfig::named("sarvam");
        let err = OpenAiLanguageModel::from_config(&provider, &LlmConfig::default())
            .err()
            .unwrap();
        assert!(!err.is_transient());
    }
}
