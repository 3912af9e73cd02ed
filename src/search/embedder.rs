use crate::core::config::{Config, EmbeddingProvider, EmbeddingSettings};
use crate::core::error::{Error, Result};
use crate::search::model::EmbeddingModel;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Turns text into vectors. A batch either succeeds for every input or
/// fails as a whole.
pub trait Embedder: Send + Sync {
    /// Identifier of the model producing the vectors
    fn model_id(&self) -> &str;

    /// Embed document chunks in one batch call
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the embedder selected in the settings.
///
/// The provider is only initialised on the first embedding request, so
/// commands that never embed (status, list, reset) do not load a model.
pub fn build_embedder(config: &Config) -> Arc<dyn Embedder> {
    Arc::new(LazyEmbedder {
        model_id: config.settings.embedding.model.clone(),
        config: config.clone(),
        inner: Mutex::new(None),
    })
}

fn init_provider(config: &Config) -> Result<Arc<dyn Embedder>> {
    let settings = &config.settings.embedding;
    match settings.provider {
        EmbeddingProvider::Local => Ok(Arc::new(EmbeddingModel::init(config)?)),
        EmbeddingProvider::OpenAi => Ok(Arc::new(HttpEmbedder::from_settings(settings)?)),
    }
}

struct LazyEmbedder {
    model_id: String,
    config: Config,
    inner: Mutex<Option<Arc<dyn Embedder>>>,
}

impl LazyEmbedder {
    fn provider(&self) -> Result<Arc<dyn Embedder>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| Error::EmbeddingService(format!("Failed to lock embedder: {}", e)))?;
        if let Some(provider) = inner.as_ref() {
            return Ok(Arc::clone(provider));
        }
        let provider = init_provider(&self.config).map_err(|e| {
            Error::EmbeddingService(format!("Failed to initialise {}: {}", self.model_id, e))
        })?;
        *inner = Some(Arc::clone(&provider));
        Ok(provider)
    }
}

impl Embedder for LazyEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.provider()?.embed_documents(texts)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.provider()?.embed_query(text)
    }
}

/// Reject batches whose size does not match the request
pub fn check_batch(expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(Error::EmbeddingService(format!(
            "expected {} embeddings, received {}",
            expected,
            vectors.len()
        )));
    }
    Ok(vectors)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for OpenAI-compatible `/embeddings` endpoints
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpEmbedder {
    pub fn new(api_base: &str, model: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", api_base.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
            Error::Config(format!(
                "Environment variable {} is not set",
                settings.api_key_env
            ))
        })?;
        Self::new(
            &settings.api_base,
            &settings.model,
            api_key,
            Duration::from_secs(settings.timeout_secs),
        )
    }

    fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
            })
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    Error::EmbeddingService(format!("request timed out: {}", e))
                } else {
                    Error::EmbeddingService(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::EmbeddingService(format!(
                "embedding API returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| Error::EmbeddingService(format!("invalid response body: {}", e)))?;
        Ok(order_by_index(parsed.data))
    }
}

fn order_by_index(mut data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.request(texts)?;
        check_batch(texts.len(), vectors)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = check_batch(1, self.request(&[text.to_string()])?)?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingService("empty response".to_string()))
    }
}
