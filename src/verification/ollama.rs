// src/verification/ollama.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::OllamaConfig;
use crate::verification::{GenerationOutput, GenerativeBackend};

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a JsonValue,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// Local Ollama server, `/api/generate` with a JSON-schema `format`.
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    /// The per-attempt timeout is enforced by the verifier, not the client.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client for Ollama")?;
        Ok(Self { client, config })
    }

    /// Checks the server is reachable and lists models, like `ollama list`.
    pub async fn check_available(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.url))
            .send()
            .await
            .with_context(|| format!("Failed to reach Ollama at {}", self.config.url))?;
        if !response.status().is_success() {
            return Err(anyhow!("Ollama returned status: {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl GenerativeBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str, schema: &JsonValue) -> Result<GenerationOutput> {
        let request = OllamaRequest {
            model: &self.config.model,
            prompt,
            format: schema,
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
                top_p: 0.9,
                repeat_penalty: 1.1,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.config.url))
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            return Err(anyhow!("Ollama returned status: {}", response.status()));
        }

        let body: OllamaResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;
        debug!("Raw verifier response: {}", body.response);

        Ok(GenerationOutput {
            text: body.response,
            prompt_tokens: body.prompt_eval_count.unwrap_or(0),
            completion_tokens: body.eval_count.unwrap_or(0),
        })
    }
}
