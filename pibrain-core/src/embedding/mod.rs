//! Embedding providers: text-to-vector projection for the insight
//! aggregator's clustering pass. Pluggable per §4.7/§6; the mock path needs
//! no network and is deterministic, so tests and offline daemons never need
//! a live embedding endpoint.

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Projects text into a fixed-dimension vector space.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;
    fn dimensions(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Builds the configured provider, or `None` if embedding is unconfigured
/// (the insight aggregator then falls back to token-Jaccard clustering).
pub fn create_provider(config: Option<&EmbeddingConfig>) -> Result<Option<Box<dyn EmbeddingProvider>>> {
    let Some(config) = config else { return Ok(None) };
    match config.provider {
        EmbeddingProviderKind::Mock => Ok(Some(Box::new(MockEmbeddingProvider::new(config.dimensions, config.model.clone())))),
        _ => Ok(Some(Box::new(HttpEmbeddingProvider::new(config)?))),
    }
}

/// Deterministic pseudo-embedding: hashes each text with SHA-256 and spreads
/// the digest bytes across `dimensions` buckets normalized to `[-1, 1]`.
/// Used for tests and any daemon run without a configured embedding
/// endpoint; same text always yields the same vector.
pub struct MockEmbeddingProvider {
    dimensions: usize,
    model: String,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize, model: String) -> Self {
        MockEmbeddingProvider { dimensions, model }
    }
}

impl EmbeddingProvider for MockEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|t| hash_to_vector(t, self.dimensions)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn hash_to_vector(text: &str, dimensions: usize) -> Vec<f64> {
    let mut vector = Vec::with_capacity(dimensions);
    let mut counter: u64 = 0;
    while vector.len() < dimensions {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        for byte in digest {
            if vector.len() == dimensions {
                break;
            }
            vector.push((byte as f64 / 127.5) - 1.0);
        }
        counter += 1;
    }
    vector
}

/// HTTP-backed provider over Ollama, an OpenAI-compatible embeddings
/// endpoint, or OpenRouter, following the teacher's `HttpLlmAssessmentClient`
/// shape: a dedicated current-thread `tokio::runtime::Runtime` wraps async
/// `reqwest` calls behind a synchronous trait so the aggregator (which runs
/// on the scheduler's plain thread) never needs to touch async itself.
pub struct HttpEmbeddingProvider {
    provider: EmbeddingProviderKind,
    model: String,
    endpoint: String,
    api_key: Option<String>,
    dimensions: usize,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_endpoint(config.provider).to_string());

        let api_key = match config.provider {
            EmbeddingProviderKind::Ollama | EmbeddingProviderKind::Mock => config.api_key.clone(),
            EmbeddingProviderKind::OpenAiCompatible => {
                config.api_key.clone().or_else(|| std::env::var("OPENAI_API_KEY").ok())
            }
            EmbeddingProviderKind::OpenRouter => {
                config.api_key.clone().or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
            }
        };

        if matches!(config.provider, EmbeddingProviderKind::OpenAiCompatible | EmbeddingProviderKind::OpenRouter)
            && api_key.is_none()
        {
            return Err(Error::Config("embedding.apiKey (or provider env var) is required".to_string()));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpEmbeddingProvider {
            provider: config.provider,
            model: config.model.clone(),
            endpoint,
            api_key,
            dimensions: config.dimensions,
            runtime,
            http,
        })
    }

    async fn embed_batch_async(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            EmbeddingProviderKind::Ollama => self.embed_ollama(texts).await,
            EmbeddingProviderKind::OpenAiCompatible | EmbeddingProviderKind::OpenRouter => {
                self.embed_openai_compatible(texts).await
            }
            EmbeddingProviderKind::Mock => unreachable!("mock path uses MockEmbeddingProvider directly"),
        }
    }

    async fn embed_ollama(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let url = format!("{}/api/embed", self.endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| Error::Analyzer(format!("ollama embedding request failed: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Analyzer(format!("ollama read body failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Analyzer(format!("ollama returned {}: {}", status.as_u16(), body)));
        }
        let parsed: serde_json::Value = serde_json::from_str(&body)?;
        parsed
            .get("embeddings")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(value_to_vector).collect())
            .ok_or_else(|| Error::Analyzer("ollama response missing array field `embeddings`".to_string()))
    }

    async fn embed_openai_compatible(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        let url = format!("{}/v1/embeddings", self.endpoint.trim_end_matches('/'));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = format!("Bearer {}", self.api_key.as_deref().unwrap_or_default());
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth).map_err(|e| Error::Analyzer(format!("invalid api key header: {e}")))?);

        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .map_err(|e| Error::Analyzer(format!("embedding request failed: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Analyzer(format!("embedding read body failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Analyzer(format!("embedding endpoint returned {}: {}", status.as_u16(), body)));
        }
        let parsed: serde_json::Value = serde_json::from_str(&body)?;
        parsed
            .get("data")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|entry| entry.get("embedding")).map(value_to_vector).collect())
            .ok_or_else(|| Error::Analyzer("embedding response missing array field `data`".to_string()))
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        self.runtime.block_on(self.embed_batch_async(texts))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn value_to_vector(value: &serde_json::Value) -> Vec<f64> {
    value.as_array().map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect()).unwrap_or_default()
}

fn default_endpoint(provider: EmbeddingProviderKind) -> &'static str {
    match provider {
        EmbeddingProviderKind::Ollama => "http://localhost:11434",
        EmbeddingProviderKind::OpenAiCompatible => "https://api.openai.com",
        EmbeddingProviderKind::OpenRouter => "https://openrouter.ai/api",
        EmbeddingProviderKind::Mock => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_is_deterministic() {
        let provider = MockEmbeddingProvider::new(16, "mock".into());
        let a = provider.embed(&["fixed the queue bug".to_string()]).unwrap();
        let b = provider.embed(&["fixed the queue bug".to_string()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[test]
    fn mock_provider_distinguishes_different_text() {
        let provider = MockEmbeddingProvider::new(8, "mock".into());
        let a = provider.embed(&["alpha".to_string()]).unwrap();
        let b = provider.embed(&["beta".to_string()]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn create_provider_returns_none_when_unconfigured() {
        assert!(create_provider(None).unwrap().is_none());
    }
}
