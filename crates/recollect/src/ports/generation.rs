//! Text generation capability
//!
//! [`RemoteGenerator`] talks to any OpenAI-compatible chat-completions
//! endpoint with a configurable URL, model, and API key read from an
//! environment variable.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GenerationConfig;
use crate::error::{MemoryError, Result};

/// Sampling settings for a single generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Overrides the adapter's configured model
    pub model: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
            model: None,
        }
    }
}

/// Turns a prompt into text
#[async_trait]
pub trait GenerationPort: Send + Sync {
    /// Run one completion
    async fn generate(&self, prompt: &str, options: GenerationOptions) -> Result<String>;

    /// Get the adapter name for logging
    fn name(&self) -> &'static str;
}

/// Generator using OpenAI-compatible HTTP APIs
#[derive(Debug)]
pub struct RemoteGenerator {
    client: Client,
    config: GenerationConfig,
    api_key: String,
    initial_backoff: Duration,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

const MAX_RETRIES: u32 = 3;

impl RemoteGenerator {
    /// Create a generator, reading the API key from `config.api_key_env`.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env).map_err(|_| {
            MemoryError::Config(format!("API key env var '{}' not set", config.api_key_env))
        })?;
        Self::with_api_key(config, api_key)
    }

    /// Create a generator with an explicit API key
    pub fn with_api_key(config: &GenerationConfig, api_key: impl Into<String>) -> Result<Self> {
        if config.api_url.is_empty() {
            return Err(MemoryError::Config(
                "generation.api_url must be set".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::Generation(e.to_string()))?;

        info!(
            "RemoteGenerator initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );

        Ok(Self {
            client,
            config: config.clone(),
            api_key: api_key.into(),
            initial_backoff: Duration::from_secs(1),
        })
    }

    /// Override the first back-off delay (doubles on every retry)
    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    /// Use a different model than the configured one
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl GenerationPort for RemoteGenerator {
    /// Makes up to 3 attempts, backing off exponentially on 429 and transport errors.
    async fn generate(&self, prompt: &str, options: GenerationOptions) -> Result<String> {
        let request = ChatCompletionRequest {
            model: options.model.unwrap_or_else(|| self.config.model.clone()),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        debug!("Calling generation API at: {}", url);

        let mut last_error = None;
        let mut delay = self.initial_backoff;

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            MAX_RETRIES,
                            delay
                        );
                        last_error = Some("rate limited".to_string());
                        if attempt < MAX_RETRIES - 1 {
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(MemoryError::Generation(format!(
                            "API returned {status}: {error_text}"
                        )));
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| MemoryError::GenerationParse(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| MemoryError::GenerationParse("Empty response".to_string()));
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt < MAX_RETRIES - 1 {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(MemoryError::Generation(format!(
            "Failed after {} attempts: {}",
            MAX_RETRIES,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_url() {
        let config = GenerationConfig::default();
        let err = RemoteGenerator::with_api_key(&config, "key").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn test_missing_env_key() {
        let config = GenerationConfig {
            api_url: "http://localhost:1".to_string(),
            api_key_env: "RECOLLECT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        let err = RemoteGenerator::new(&config).unwrap_err();
        assert!(err.to_string().contains("RECOLLECT_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_model_override() {
        let config = GenerationConfig {
            api_url: "http://localhost:1".to_string(),
            ..Default::default()
        };
        let generator = RemoteGenerator::with_api_key(&config, "k")
            .unwrap()
            .with_model("llama3.2");
        assert_eq!(generator.model(), "llama3.2");
    }
}
