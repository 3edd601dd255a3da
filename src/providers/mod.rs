//! Language Model and Embedding Providers
//!
//! Local-first:
//! 1. Ollama (`/api/generate`, `/api/embeddings`)
//! 2. Any OpenAI-compatible server (LM Studio, vLLM, OpenAI)

use async_trait::async_trait;
use base64_lib::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Non-2xx response from the model server
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Text generation, optionally conditioned on base64-encoded images
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        images: &[String],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ProviderError>;
}

/// Fixed-length text embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Base64 payload for the `images` argument of [`LanguageModel::generate`]
pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::ModelUnavailable(format!("{}: {}", status, body)))
}

/// Ollama provider
pub struct OllamaClient {
    base_url: String,
    model: String,
    embed_model: String,
    client: Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
    stream: bool,
    options: GenerateOptions,
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaClient {
    pub fn new(url: &str, model: &str) -> Self {
        Self {
            base_url: url.trim_end_matches('/').into(),
            model: model.into(),
            embed_model: DEFAULT_EMBED_MODEL.into(),
            client: http_client(),
        }
    }

    pub fn with_embed_model(mut self, model: &str) -> Self {
        self.embed_model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        images: &[String],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images,
            stream: false,
            options: GenerateOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        debug!(model = %self.model, images = images.len(), "ollama generate");
        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.response)
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.embed_model,
            prompt: text,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(ProviderError::Decode("empty embedding".into()));
        }
        Ok(body.embedding)
    }
}

/// OpenAI-compatible provider (LM Studio, OpenAI, etc.)
pub struct OpenAiCompatible {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(url: &str, model: &str) -> Self {
        Self {
            base_url: url.trim_end_matches('/').into(),
            api_key: None,
            model: model.into(),
            client: http_client(),
        }
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn user_content(prompt: &str, images: &[String]) -> Value {
        if images.is_empty() {
            return Value::String(prompt.into());
        }
        let mut parts = vec![json!({"type": "text", "text": prompt})];
        parts.extend(images.iter().map(|b64| {
            json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", b64)}
            })
        }));
        Value::Array(parts)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatible {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn generate(
        &self,
        prompt: &str,
        images: &[String],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": Self::user_content(prompt, images)}],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let mut req = self.client.post(&url).json(&request);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        debug!(model = %self.model, images = images.len(), "chat completion");
        let response = check_status(req.send().await?).await?;

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Decode("no response content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_ollama_generate() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({
                "model": "llava",
                "stream": false,
                "options": {"num_predict": 256}
            })))
            .with_status(200)
            .with_body(r#"{"response": "{\"type\": \"NOOP\"}", "done": true}"#)
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), "llava");
        let out = client.generate("hello", &[], 256, 0.1).await.unwrap();
        assert_eq!(out, r#"{"type": "NOOP"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_is_model_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .with_status(503)
            .with_body("loading")
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), "llava");
        let err = client.generate("hello", &[], 16, 0.1).await.unwrap_err();
        assert!(matches!(err, ProviderError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/embeddings")
            .match_body(Matcher::PartialJson(json!({"model": "nomic-embed-text"})))
            .with_status(200)
            .with_body(r#"{"embedding": [0.1, 0.2, 0.3]}"#)
            .create_async()
            .await;

        let client = OllamaClient::new(&server.url(), "llava");
        assert_eq!(client.embed("Click Start").await.unwrap(), vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_openai_compatible_with_image() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::Regex("data:image/png;base64,".into()))
            .with_status(200)
            .with_body(r#"{"choices": [{"message": {"role": "assistant", "content": "ok"}}]}"#)
            .create_async()
            .await;

        let client = OpenAiCompatible::new(&server.url(), "local").with_api_key("sk-test");
        let images = vec![encode_image(b"png")];
        assert_eq!(client.generate("look", &images, 64, 0.2).await.unwrap(), "ok");
    }
}
