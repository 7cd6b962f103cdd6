use crate::blocking::run_blocking;
use crate::embeddings::EmbeddingProvider;
use crate::extractor::DocumentImageExtractor;
use crate::similarity::{dot, rank, validate_dimensions};
use crate::{
    CandidateEmbedding, Embedding, ExtractedImage, PdfDocument, RankedResult, SearchConfig,
    SearchError, SimilarityScore,
};
use image::RgbImage;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Runs text-to-image search and single-image keyword containment.
///
/// The embedding provider is shared, not owned: one model instance usually
/// serves every coordinator and request in the process.
pub struct ImageSearchCoordinator<E, P>
where
    E: DocumentImageExtractor,
    P: EmbeddingProvider + ?Sized,
{
    extractor: E,
    provider: Arc<P>,
    config: SearchConfig,
}

impl<E, P> ImageSearchCoordinator<E, P>
where
    E: DocumentImageExtractor + Clone + 'static,
    P: EmbeddingProvider + ?Sized + 'static,
{
    pub fn new(extractor: E, provider: Arc<P>, config: SearchConfig) -> Self {
        Self {
            extractor,
            provider,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Ranks the images embedded in `document` against `query_text`.
    pub async fn search(
        &self,
        query_text: &str,
        document: &PdfDocument,
    ) -> Result<Vec<RankedResult>, SearchError> {
        require_text(query_text, "query")?;
        let extractor = self.extractor.clone();
        let document = document.clone();
        let images = run_blocking(move || extractor.extract(&document)).await?;
        self.rank_images(query_text, images).await
    }

    /// Ranks caller-supplied images. Each image keeps its `source_index`.
    pub async fn rank_images(
        &self,
        query_text: &str,
        images: Vec<ExtractedImage>,
    ) -> Result<Vec<RankedResult>, SearchError> {
        require_text(query_text, "query")?;

        if images.is_empty() {
            debug!("no candidate images, skipping embedding");
            return Ok(Vec::new());
        }

        let image_count = images.len();
        let (query, candidates) = self
            .with_deadline(async {
                let query = self.provider.embed_text(query_text).await?;
                let candidates = self.embed_candidates(images).await?;
                Ok((query, candidates))
            })
            .await?;

        if let Err(mismatch) = validate_dimensions(&query, &candidates) {
            error!(provider = self.provider.name(), %mismatch, "embedding dimensions disagree");
            return Err(mismatch);
        }

        let mut ranked = rank(&query, &candidates);
        if let Some(limit) = self.config.max_results {
            ranked.truncate(limit);
        }

        debug!(
            query_len = query_text.len(),
            image_count,
            returned = ranked.len(),
            "ranked images"
        );
        Ok(ranked)
    }

    /// Raw similarity between `image` and `keyword`.
    pub async fn containment_score(
        &self,
        image: &RgbImage,
        keyword: &str,
    ) -> Result<SimilarityScore, SearchError> {
        require_text(keyword, "keyword")?;

        let (image_vector, text_vector) = self
            .with_deadline(async {
                let image_vector = self.provider.embed_image(image).await?;
                let text_vector = self.provider.embed_text(keyword).await?;
                Ok((image_vector, text_vector))
            })
            .await?;

        if image_vector.len() != text_vector.len() {
            let mismatch = SearchError::DimensionMismatch {
                expected: text_vector.len(),
                found: image_vector.len(),
                source_index: None,
            };
            error!(provider = self.provider.name(), %mismatch, "embedding dimensions disagree");
            return Err(mismatch);
        }

        Ok(dot(&image_vector, &text_vector))
    }

    /// True when the containment score strictly exceeds the configured
    /// threshold.
    pub async fn image_contains(&self, image: &RgbImage, keyword: &str) -> Result<bool, SearchError> {
        let score = self.containment_score(image, keyword).await?;
        Ok(exceeds_threshold(score, self.config.containment_threshold))
    }

    async fn embed_candidates(
        &self,
        images: Vec<ExtractedImage>,
    ) -> Result<Vec<CandidateEmbedding>, SearchError> {
        let limit = self.config.embedding_concurrency.max(1);

        if limit == 1 {
            let mut candidates = Vec::with_capacity(images.len());
            for image in &images {
                candidates.push(CandidateEmbedding {
                    source_index: image.source_index,
                    embedding: self.provider.embed_image(&image.pixels).await?,
                });
            }
            return Ok(candidates);
        }

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        let count = images.len();

        for (position, image) in images.into_iter().enumerate() {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|error| SearchError::EmbeddingUnavailable(error.to_string()))?;
                let embedding: Embedding = provider.embed_image(&image.pixels).await?;
                Ok::<_, SearchError>((
                    position,
                    CandidateEmbedding {
                        source_index: image.source_index,
                        embedding,
                    },
                ))
            });
        }

        // Completion order is arbitrary; slot results by input position.
        let mut slots: Vec<Option<CandidateEmbedding>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (position, candidate) = joined.map_err(|error| {
                SearchError::EmbeddingUnavailable(format!("embedding task failed: {error}"))
            })??;
            slots[position] = Some(candidate);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    SearchError::EmbeddingUnavailable("embedding task produced no result".to_string())
                })
            })
            .collect()
    }

    async fn with_deadline<T, F>(&self, work: F) -> Result<T, SearchError>
    where
        F: Future<Output = Result<T, SearchError>>,
    {
        match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                SearchError::EmbeddingUnavailable(format!(
                    "embedding did not finish within {limit:?}"
                ))
            })?,
            None => work.await,
        }
    }
}

pub fn exceeds_threshold(score: SimilarityScore, threshold: f32) -> bool {
    score > threshold
}

fn require_text(value: &str, field: &str) -> Result<(), SearchError> {
    if value.trim().is_empty() {
        return Err(SearchError::InvalidRequest(format!("{field} is empty")));
    }
    Ok(())
}
