mod blocking;
pub mod colorspace;
pub mod discover;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod image_input;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod similarity;

#[cfg(test)]
mod test_support;

pub use discover::{discover_image_files, load_image_folder, ImageCorpus, SkippedImage};
pub use embeddings::{EmbeddingProvider, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ErrorClass, Result, SearchError};
pub use extractor::{extract_images, DocumentImageExtractor, LopdfImageExtractor};
pub use image::RgbImage;
pub use image_input::{decode_base64_image, decode_image_bytes, fetch_image, to_png_data_url, ImageSource};
pub use models::{
    CandidateEmbedding, Embedding, ExtractedImage, PdfDocument, RankedResult, SearchConfig,
    SimilarityScore, DEFAULT_CONTAINMENT_THRESHOLD,
};
pub use orchestrator::{exceeds_threshold, ImageSearchCoordinator};
pub use providers::{HashingEmbeddingProvider, RemoteEmbeddingConfig, RemoteEmbeddingProvider};
pub use similarity::{dot, normalize, rank, validate_dimensions};
