use crate::embeddings::{EmbeddingProvider, DEFAULT_EMBEDDING_DIMENSIONS};
use crate::error::SearchError;
use crate::models::Embedding;
use crate::similarity::normalize;
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbImage;

const THUMBNAIL_SIDE: u32 = 16;
const GRID_CELLS: u32 = 4;
const COLOR_LEVELS: u8 = 4;

/// Deterministic, model-free provider for offline runs and tests.
///
/// Text is hashed as character trigrams and images as coarse color
/// histograms per grid cell. Both land in vectors of the same size, but the
/// two spaces are not semantically aligned: use it to exercise the pipeline,
/// not to judge relevance.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbeddingProvider {
    pub dimensions: usize,
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn text_vector(&self, text: &str) -> Embedding {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let padded: Vec<char> = format!("^{}$", text.trim().to_lowercase()).chars().collect();

        if padded.len() > 2 {
            for window in padded.windows(3) {
                let token = window.iter().collect::<String>();
                vector[self.bucket(token.as_bytes())] += 1.0;
            }
        }

        finish(vector)
    }

    pub fn image_vector(&self, image: &RgbImage) -> Embedding {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let thumbnail = imageops::resize(image, THUMBNAIL_SIDE, THUMBNAIL_SIDE, FilterType::Triangle);
        let cell_side = THUMBNAIL_SIDE / GRID_CELLS;

        for (x, y, pixel) in thumbnail.enumerate_pixels() {
            let cell = (y / cell_side) * GRID_CELLS + x / cell_side;
            let [r, g, b] = pixel.0.map(|channel| channel / (256 / COLOR_LEVELS as u16) as u8);
            let key = [b'i', cell as u8, r, g, b];
            vector[self.bucket(&key)] += 1.0;
        }

        finish(vector)
    }

    fn bucket(&self, bytes: &[u8]) -> usize {
        let mut hash = 1469598103934665603u64;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash % self.dimensions.max(1) as u64) as usize
    }
}

/// Normalizes, mapping inputs with no features onto the first axis so the
/// unit-norm contract holds for empty text too.
fn finish(mut vector: Embedding) -> Embedding {
    if !normalize(&mut vector) {
        vector[0] = 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_text(&self, text: &str) -> Result<Embedding, SearchError> {
        Ok(self.text_vector(text))
    }

    async fn embed_image(&self, image: &RgbImage) -> Result<Embedding, SearchError> {
        Ok(self.image_vector(image))
    }
}
