//! OpenAI-compatible chat completions client.
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! (OpenAI, Azure OpenAI proxies, Ollama, vLLM, LiteLLM). The API key is
//! read from the secret store; a missing key is allowed for local servers.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{KbError, Result};
use crate::models::Prompt;
use crate::retry::RetryPolicy;
use crate::traits::{LanguageModel, SecretStore};

pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleModel {
    pub async fn connect(config: &LlmConfig, secrets: &dyn SecretStore) -> Result<Self> {
        let api_key = match secrets.get_secret(&config.api_key_secret).await {
            Ok(key) => Some(key),
            Err(KbError::NotFound(_)) => {
                warn!(
                    secret = %config.api_key_secret,
                    "no model API key configured, sending unauthenticated requests"
                );
                None
            }
            Err(e) => return Err(e),
        };
        Self::new(config, api_key.as_deref())
    }

    pub fn new(config: &LlmConfig, api_key: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| KbError::config("model API key contains invalid characters"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                ..RetryPolicy::default()
            },
        })
    }

    async fn complete_once(&self, body: &ChatCompletionsRequest<'_>) -> Result<String> {
        let resp = self.client.post(&self.url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KbError::from_status(status, "chat completion"));
        }
        let parsed: ChatCompletionsResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| KbError::InvalidResponse("chat completion had no content".into()))
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        if !prompt.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &prompt.system,
            });
        }
        messages.extend(prompt.messages.iter().map(|m| ChatMessage {
            role: &m.role,
            content: &m.content,
        }));
        let body = ChatCompletionsRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        debug!(model = %self.model, messages = body.messages.len(), "chat completion");
        self.retry
            .run("chat completion", || self.complete_once(&body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> LlmConfig {
        LlmConfig {
            base_url: format!("{}/v1", server.uri()),
            model: "test-model".into(),
            max_retries: 1,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn sends_system_and_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            })))
            .mount(&server)
            .await;

        let model = OpenAiCompatibleModel::new(&config(&server), Some("sk-test")).unwrap();
        let mut prompt = Prompt::new("be brief");
        prompt.push(Role::User, "hello");
        assert_eq!(model.complete(&prompt).await.unwrap(), "hi there");
    }

    #[tokio::test]
    async fn empty_choices_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let model = OpenAiCompatibleModel::new(&config(&server), None).unwrap();
        let err = model.complete(&Prompt::new("x")).await.unwrap_err();
        assert!(matches!(err, KbError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let model = OpenAiCompatibleModel::new(&config(&server), None).unwrap();
        let err = model.complete(&Prompt::new("x")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
