use crate::embeddings::{EmbeddingProvider, DEFAULT_EMBEDDING_DIMENSIONS};
use crate::error::SearchError;
use crate::image_input::to_png_data_url;
use crate::models::Embedding;
use crate::similarity::normalize;
use async_trait::async_trait;
use image::RgbImage;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct RemoteEmbeddingConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub timeout: Option<Duration>,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5000".to_string(),
            api_key: None,
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            timeout: None,
        }
    }
}

/// Client for an embedding service exposing `POST /embed-text` and
/// `POST /embed-image`, each answering `{"embedding": [[...]]}`.
///
/// The service returns raw model features; this client normalizes them.
pub struct RemoteEmbeddingProvider {
    endpoint: Url,
    api_key: Option<String>,
    client: Client,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingPayload {
    embedding: EmbeddingShape,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingShape {
    Batch(Vec<Vec<f32>>),
    Single(Vec<f32>),
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: RemoteEmbeddingConfig) -> Result<Self, SearchError> {
        let mut endpoint = Url::parse(config.endpoint.trim()).map_err(|error| {
            SearchError::InvalidRequest(format!(
                "invalid embedding endpoint {}: {error}",
                config.endpoint
            ))
        })?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|error| SearchError::EmbeddingUnavailable(error.to_string()))?;

        let api_key = config
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Ok(Self {
            endpoint,
            api_key,
            client,
            dimensions: config.dimensions,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn route(&self, path: &str) -> Result<Url, SearchError> {
        self.endpoint
            .join(path)
            .map_err(|error| SearchError::InvalidRequest(error.to_string()))
    }

    async fn request_embedding(&self, path: &str, body: Value) -> Result<Embedding, SearchError> {
        let url = self.route(path)?;
        let mut request = self.client.post(url.clone()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            SearchError::EmbeddingUnavailable(format!("request to {url} failed: {error}"))
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|error| {
            SearchError::EmbeddingUnavailable(format!("reading response from {url}: {error}"))
        })?;

        if !status.is_success() {
            return Err(SearchError::EmbeddingUnavailable(format!(
                "{url} returned {status}: {}",
                error_message(&text)
            )));
        }

        debug!(%url, bytes = text.len(), "embedding response received");
        parse_embedding_payload(&text, self.dimensions)
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorPayload>(body) {
        Ok(payload) => payload.error,
        Err(_) => body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    }
}

fn parse_embedding_payload(body: &str, dimensions: usize) -> Result<Embedding, SearchError> {
    let payload: EmbeddingPayload = serde_json::from_str(body).map_err(|error| {
        SearchError::EmbeddingUnavailable(format!("malformed embedding response: {error}"))
    })?;

    let mut vector = match payload.embedding {
        EmbeddingShape::Batch(mut rows) if rows.len() == 1 => rows.remove(0),
        EmbeddingShape::Batch(rows) => {
            return Err(SearchError::EmbeddingUnavailable(format!(
                "expected one embedding, got {}",
                rows.len()
            )))
        }
        EmbeddingShape::Single(vector) => vector,
    };

    if vector.len() != dimensions {
        return Err(SearchError::DimensionMismatch {
            expected: dimensions,
            found: vector.len(),
            source_index: None,
        });
    }
    if !normalize(&mut vector) {
        return Err(SearchError::EmbeddingUnavailable(
            "embedding service returned a zero vector".to_string(),
        ));
    }

    Ok(vector)
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn name(&self) -> &str {
        "remote"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_text(&self, text: &str) -> Result<Embedding, SearchError> {
        self.request_embedding("embed-text", json!({ "text": text }))
            .await
    }

    async fn embed_image(&self, image: &RgbImage) -> Result<Embedding, SearchError> {
        let data_url = to_png_data_url(image)?;
        self.request_embedding("embed-image", json!({ "image_url": data_url }))
            .await
    }
}
