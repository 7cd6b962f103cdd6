use clap::{Args, ValueEnum};
use image_search_core::{
    EmbeddingProvider, HashingEmbeddingProvider, ImageSearchCoordinator, LopdfImageExtractor,
    RemoteEmbeddingConfig, RemoteEmbeddingProvider, SearchConfig, SearchError,
    DEFAULT_CONTAINMENT_THRESHOLD, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::sync::Arc;
use std::time::Duration;

pub type Coordinator = ImageSearchCoordinator<LopdfImageExtractor, dyn EmbeddingProvider>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// HTTP embedding service exposing /embed-text and /embed-image.
    Remote,
    /// Deterministic offline provider; pipeline checks only.
    Hashing,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Embedding backend
    #[arg(long, value_enum, env = "IMAGE_SEARCH_PROVIDER", default_value = "remote")]
    pub provider: ProviderKind,

    /// Embedding service base URL
    #[arg(long, env = "IMAGE_SEARCH_EMBEDDING_URL", default_value = "http://localhost:5000")]
    pub embedding_url: String,

    /// Bearer token for the embedding service
    #[arg(long, env = "IMAGE_SEARCH_EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,

    /// Embedding dimension shared by text and image vectors
    #[arg(long, env = "IMAGE_SEARCH_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    pub dimensions: usize,

    /// Score a keyword must exceed for image-contains to answer true
    #[arg(long, env = "IMAGE_SEARCH_CONTAINMENT_THRESHOLD", default_value_t = DEFAULT_CONTAINMENT_THRESHOLD)]
    pub containment_threshold: f32,

    /// Keep only the best N results
    #[arg(long, env = "IMAGE_SEARCH_MAX_RESULTS")]
    pub max_results: Option<usize>,

    /// Image embedding calls allowed in flight per request
    #[arg(long, env = "IMAGE_SEARCH_EMBEDDING_CONCURRENCY", default_value_t = 1)]
    pub embedding_concurrency: usize,

    /// Deadline for the embedding phase of one request
    #[arg(long, env = "IMAGE_SEARCH_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
}

impl EngineArgs {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig::default()
            .with_containment_threshold(self.containment_threshold)
            .with_max_results(self.max_results)
            .with_embedding_concurrency(self.embedding_concurrency)
            .with_request_timeout(self.request_timeout())
    }

    pub fn build_provider(&self) -> Result<Arc<dyn EmbeddingProvider>, SearchError> {
        if self.dimensions == 0 {
            return Err(SearchError::InvalidRequest(
                "dimensions must be at least 1".to_string(),
            ));
        }

        let provider: Arc<dyn EmbeddingProvider> = match self.provider {
            ProviderKind::Hashing => Arc::new(HashingEmbeddingProvider::new(self.dimensions)),
            ProviderKind::Remote => Arc::new(RemoteEmbeddingProvider::new(RemoteEmbeddingConfig {
                endpoint: self.embedding_url.clone(),
                api_key: self.embedding_api_key.clone(),
                dimensions: self.dimensions,
                timeout: self.request_timeout(),
            })?),
        };
        Ok(provider)
    }

    pub fn build_coordinator(&self) -> Result<Coordinator, SearchError> {
        Ok(ImageSearchCoordinator::new(
            LopdfImageExtractor,
            self.build_provider()?,
            self.search_config(),
        ))
    }
}
