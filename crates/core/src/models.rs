use crate::error::SearchError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONTAINMENT_THRESHOLD: f32 = 0.2;

pub type Embedding = Vec<f32>;

pub type SimilarityScore = f32;

/// An input document held in memory for the duration of one request.
#[derive(Debug, Clone)]
pub struct PdfDocument {
    bytes: Vec<u8>,
    name: Option<String>,
}

impl PdfDocument {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            name: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self, SearchError> {
        let bytes = std::fs::read(path).map_err(|error| {
            SearchError::DocumentParse(format!("cannot read {}: {error}", path.display()))
        })?;

        Ok(Self {
            bytes,
            name: path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedImage {
    pub source_index: usize,
    /// 1-based page the image was found on; `None` for directly supplied images.
    pub page_number: Option<u32>,
    pub pixels: RgbImage,
}

impl ExtractedImage {
    /// Numbers directly supplied images in the order given.
    pub fn enumerate(images: impl IntoIterator<Item = RgbImage>) -> Vec<ExtractedImage> {
        images
            .into_iter()
            .enumerate()
            .map(|(source_index, pixels)| ExtractedImage {
                source_index,
                page_number: None,
                pixels,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEmbedding {
    pub source_index: usize,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    pub source_index: usize,
    pub score: SimilarityScore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub containment_threshold: f32,
    pub max_results: Option<usize>,
    pub embedding_concurrency: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            containment_threshold: DEFAULT_CONTAINMENT_THRESHOLD,
            max_results: None,
            embedding_concurrency: 1,
            request_timeout: None,
        }
    }
}

impl SearchConfig {
    pub fn with_containment_threshold(mut self, threshold: f32) -> Self {
        self.containment_threshold = threshold;
        self
    }

    pub fn with_max_results(mut self, max_results: Option<usize>) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_embedding_concurrency(mut self, concurrency: usize) -> Self {
        self.embedding_concurrency = concurrency.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{PdfDocument, RankedResult, SearchConfig};

    #[test]
    fn ranked_result_serializes_with_native_float_score() -> Result<(), serde_json::Error> {
        let result = RankedResult {
            source_index: 4,
            score: 0.5,
        };

        let json = serde_json::to_value(result)?;
        assert_eq!(json, serde_json::json!({ "sourceIndex": 4, "score": 0.5 }));
        Ok(())
    }

    #[test]
    fn default_config_matches_reference_behaviour() {
        let config = SearchConfig::default();
        assert_eq!(config.containment_threshold, 0.2);
        assert_eq!(config.max_results, None);
        assert_eq!(config.embedding_concurrency, 1);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn concurrency_never_drops_below_one() {
        let config = SearchConfig::default().with_embedding_concurrency(0);
        assert_eq!(config.embedding_concurrency, 1);
    }

    #[test]
    fn open_reports_missing_file_as_parse_error() {
        let error = PdfDocument::open(std::path::Path::new("/nonexistent/input.pdf"))
            .expect_err("missing file must fail");
        assert!(matches!(error, crate::SearchError::DocumentParse(_)));
    }
}
