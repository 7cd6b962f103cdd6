use crate::error::SearchError;
use crate::models::Embedding;
use async_trait::async_trait;
use image::RgbImage;

/// CLIP ViT-B/32, the model family the embedding service is built around.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 512;

/// Maps text and images into one shared vector space.
///
/// Every returned embedding is L2-normalized and exactly `dimensions()`
/// long. One provider instance is shared by all in-flight requests, so
/// implementations must be safe to call concurrently through `&self`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_text(&self, text: &str) -> Result<Embedding, SearchError>;

    async fn embed_image(&self, image: &RgbImage) -> Result<Embedding, SearchError>;
}
