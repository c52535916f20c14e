//! Sentence-encoder abstraction.
//!
//! The real encoder is an external service consumed as a black box:
//! `encode(texts) -> float32[n][d]`. A deterministic hash projection stands
//! in for it in tests and air-gapped deployments.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use shared::error::CommonError;

pub const DEFAULT_EMBEDDING_DIM: usize = 384;
const ENCODE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError>;
    fn dim(&self) -> usize;
    fn model_id(&self) -> &str;
}

/// Client for an HTTP sentence-encoder endpoint (text-embeddings-inference
/// style: POST `{"inputs": [...]}` returning a float matrix).
pub struct HttpEmbedder {
    http: reqwest::Client,
    url: String,
    model: String,
    dim: usize,
}

impl HttpEmbedder {
    pub fn new(url: impl Into<String>, model: impl Into<String>, dim: usize) -> Result<Self, CommonError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            url: url.into(),
            model: model.into(),
            dim,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum EncodeResponse {
            Plain(Vec<Vec<f32>>),
            Wrapped { embeddings: Vec<Vec<f32>> },
        }

        let response = self
            .http
            .post(&self.url)
            .timeout(ENCODE_TIMEOUT)
            .json(&serde_json::json!({ "inputs": texts, "model": self.model }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| CommonError::Upstream {
                msg: "embedding endpoint answered with an error".to_string(),
                source: Some(e.into()),
            })?;

        let vectors = match response.json::<EncodeResponse>().await.map_err(|e| {
            CommonError::Upstream {
                msg: "embedding response did not parse".to_string(),
                source: Some(e.into()),
            }
        })? {
            EncodeResponse::Plain(v) => v,
            EncodeResponse::Wrapped { embeddings } => embeddings,
        };

        if vectors.len() != texts.len() || vectors.iter().any(|v| v.len() != self.dim) {
            return Err(CommonError::upstream(format!(
                "embedding endpoint returned {} vectors, expected {} of dim {}",
                vectors.len(),
                texts.len(),
                self.dim
            )));
        }
        Ok(vectors)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Deterministic token-hash projection. Not a semantic model, but texts
/// sharing tokens land near each other, which is what the tests pin down.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        Ok(texts.iter().map(|t| self.project(t)).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        "hash-projection"
    }
}

impl HashEmbedder {
    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }
        vector
    }
}
