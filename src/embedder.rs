//! Text embeddings from an OpenAI-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array1;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result, Service};

/// Turns text into unit-length vectors of a fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Array1<f32>>;
}

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RagError::config("missing OpenAI API key"));
        }
        if model.trim().is_empty() {
            return Err(RagError::config("missing embedding model name"));
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| RagError::config("invalid OpenAI API key"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::config(format!("failed to build OpenAI HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Array1<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| RagError::from_reqwest(Service::Embedding, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::from_status(Service::Embedding, status, body));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| RagError::malformed(Service::Embedding, err.to_string()))?;
        let embedding = parsed.into_single()?;
        if embedding.len() != self.dimension {
            return Err(RagError::malformed(
                Service::Embedding,
                format!(
                    "expected {} dimensions, received {}",
                    self.dimension,
                    embedding.len()
                ),
            ));
        }
        normalize(embedding)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

impl EmbeddingResponse {
    fn into_single(self) -> Result<Vec<f32>> {
        self.data
            .into_iter()
            .min_by_key(|entry| entry.index)
            .map(|entry| entry.embedding)
            .ok_or_else(|| RagError::malformed(Service::Embedding, "response contained no embedding"))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Scales a raw embedding to unit L2 norm.
pub fn normalize(raw: Vec<f32>) -> Result<Array1<f32>> {
    let vector = Array1::from(raw);
    let norm = vector.dot(&vector).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(RagError::malformed(
            Service::Embedding,
            "embedding has zero or non-finite norm",
        ));
    }
    Ok(vector / norm)
}

pub fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot_product = a.dot(b);
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
