use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use talon_core::error::{Result, TalonError};
use talon_core::traits::CompletionClient;
use talon_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

impl CompletionClient for AnthropicClient {
    fn complete(
        &self,
        options: CompletionOptions,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .map_err(|_| TalonError::Provider("ANTHROPIC_API_KEY not set".into()))?;

            // System messages go in the dedicated field, not the turn list
            let system = messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.clone())
                .reduce(|acc, s| format!("{}\n\n{}", acc, s));

            let turns: Vec<ApiMessage> = messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    content: m.content.clone(),
                })
                .collect();

            let request = AnthropicRequest {
                model: options.model.clone(),
                max_tokens: options.max_tokens,
                temperature: options.temperature,
                system,
                messages: turns,
            };

            debug!(model = %options.model, "Sending Anthropic completion request");

            let response = self
                .http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request)
                .send()
                .await
                .map_err(|e| TalonError::Provider(format!("Anthropic request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiErrorBody>(&body)
                    .map(|b| b.error.message)
                    .unwrap_or(body);
                return Err(TalonError::Provider(format!(
                    "Anthropic API error {}: {}",
                    status, message
                )));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| TalonError::Provider(format!("Anthropic response parse: {}", e)))?;

            let content = parsed
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("");

            Ok(Completion { content })
        })
    }
}
