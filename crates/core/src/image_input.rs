use crate::blocking::run_blocking;
use crate::error::SearchError;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::Client;
use std::io::Cursor;
use tracing::debug;
use url::Url;

/// Where a directly supplied image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    /// Bare base64 or a `data:image/...;base64,` URI.
    Base64(String),
    Url(String),
}

impl ImageSource {
    /// Classifies a single string field: data URIs and anything that is not
    /// an http(s) URL are treated as base64.
    pub fn from_field(value: &str) -> Self {
        let trimmed = value.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            ImageSource::Url(trimmed.to_string())
        } else {
            ImageSource::Base64(trimmed.to_string())
        }
    }

    /// Decoding runs on the blocking pool; only the URL fetch stays async.
    pub async fn load(&self, client: &Client) -> Result<RgbImage, SearchError> {
        match self {
            ImageSource::Bytes(bytes) => {
                let bytes = bytes.clone();
                run_blocking(move || decode_image_bytes(&bytes)).await
            }
            ImageSource::Base64(encoded) => {
                let encoded = encoded.clone();
                run_blocking(move || decode_base64_image(&encoded)).await
            }
            ImageSource::Url(url) => fetch_image(client, url).await,
        }
    }
}

pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbImage, SearchError> {
    if bytes.is_empty() {
        return Err(SearchError::InvalidRequest("image payload is empty".to_string()));
    }

    image::load_from_memory(bytes)
        .map(|decoded| decoded.to_rgb8())
        .map_err(|error| SearchError::ImageDecode(error.to_string()))
}

pub fn decode_base64_image(value: &str) -> Result<RgbImage, SearchError> {
    let payload = match value.trim().strip_prefix("data:") {
        Some(rest) => match rest.split_once(',') {
            Some((_, data)) => data,
            None => {
                return Err(SearchError::InvalidRequest(
                    "data URL has no payload".to_string(),
                ))
            }
        },
        None => value,
    };

    let compact: String = payload.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|error| SearchError::ImageDecode(format!("invalid base64: {error}")))?;
    decode_image_bytes(&bytes)
}

pub async fn fetch_image(client: &Client, url: &str) -> Result<RgbImage, SearchError> {
    let parsed = Url::parse(url)
        .map_err(|error| SearchError::InvalidRequest(format!("invalid image url {url}: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SearchError::InvalidRequest(format!(
            "unsupported image url scheme: {}",
            parsed.scheme()
        )));
    }

    let response = client
        .get(parsed.clone())
        .send()
        .await
        .map_err(|error| SearchError::ImageFetch(format!("{parsed}: {error}")))?;
    if !response.status().is_success() {
        return Err(SearchError::ImageFetch(format!(
            "{parsed} returned {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|error| SearchError::ImageFetch(format!("{parsed}: {error}")))?;
    debug!(url = %parsed, bytes = bytes.len(), "fetched image");
    run_blocking(move || decode_image_bytes(&bytes)).await
}

pub fn to_png_data_url(image: &RgbImage) -> Result<String, SearchError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|error| SearchError::ImageDecode(format!("cannot encode png: {error}")))?;

    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buffer.into_inner())
    ))
}
