use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use talon_core::config::RetryPolicy;
use talon_core::error::{Result, TalonError};
use talon_core::traits::CompletionClient;
use talon_core::types::*;

/// A completion client that retries failed requests and falls back to
/// alternative providers.
pub struct RetryingClient {
    primary: Box<dyn CompletionClient>,
    fallbacks: Vec<(CompletionOptions, Box<dyn CompletionClient>)>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn CompletionClient>,
        fallbacks: Vec<(CompletionOptions, Box<dyn CompletionClient>)>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            policy,
        }
    }
}

fn is_retryable(e: &TalonError) -> bool {
    match e {
        TalonError::Provider(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("529")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn backoff_with_jitter(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = policy.delay_for(attempt);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
}

impl CompletionClient for RetryingClient {
    fn complete(
        &self,
        options: CompletionOptions,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let max_retries = self.policy.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 1..=max_retries + 1 {
                match self
                    .primary
                    .complete(options.clone(), messages.clone())
                    .await
                {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        if is_retryable(&e) && attempt <= max_retries {
                            let backoff = backoff_with_jitter(attempt, &self.policy);
                            warn!(
                                attempt,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying completion request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Primary exhausted — try fallbacks
            if !self.fallbacks.is_empty() {
                info!("Primary provider exhausted, trying fallbacks");
            }
            for (fb_options, fb_client) in &self.fallbacks {
                match fb_client
                    .complete(fb_options.clone(), messages.clone())
                    .await
                {
                    Ok(completion) => {
                        info!(
                            model = %fb_options.model,
                            provider = %fb_options.provider,
                            "Fell back to alternative provider"
                        );
                        return Ok(completion);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_options.model,
                            error = %e,
                            "Fallback provider also failed"
                        );
                        continue;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| TalonError::Provider("All providers failed".into())))
        })
    }
}
