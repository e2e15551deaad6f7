pub mod providers;
pub mod retry;

use talon_core::traits::CompletionClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a completion client based on the provider name.
pub fn create_client(provider: &str) -> Box<dyn CompletionClient> {
    match provider {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}
