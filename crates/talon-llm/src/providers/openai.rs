use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use talon_core::error::{Result, TalonError};
use talon_core::traits::CompletionClient;
use talon_core::types::*;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completion client.
///
/// `OPENAI_BASE_URL` points it at any compatible endpoint (Ollama, vLLM,
/// a local gateway); only the path suffix `/chat/completions` is assumed.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionClient for OpenAiClient {
    fn complete(
        &self,
        options: CompletionOptions,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| TalonError::Provider("OPENAI_API_KEY not set".into()))?;
            let base_url =
                std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

            let request = OpenAiRequest {
                model: options.model.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                messages: messages
                    .iter()
                    .map(|m| ApiMessage {
                        role: match m.role {
                            Role::System => "system",
                            Role::User => "user",
                            Role::Assistant => "assistant",
                        },
                        content: m.content.clone(),
                    })
                    .collect(),
            };

            debug!(model = %options.model, base_url = %base_url, "Sending chat completion request");

            let response = self
                .http
                .post(format!("{}/chat/completions", base_url))
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| TalonError::Provider(format!("Completion request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TalonError::Provider(format!(
                    "Completion API error {}: {}",
                    status, body
                )));
            }

            let parsed: OpenAiResponse = response
                .json()
                .await
                .map_err(|e| TalonError::Provider(format!("Completion response parse: {}", e)))?;

            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| TalonError::Provider("Completion response had no content".into()))?;

            Ok(Completion { content })
        })
    }
}
