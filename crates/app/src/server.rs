use crate::config::Coordinator;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use image_search_core::{
    exceeds_threshold, ErrorClass, ExtractedImage, ImageSource, PdfDocument,
    RankedResult, RgbImage, SearchError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct AppState {
    pub coordinator: Coordinator,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            client: reqwest::Client::new(),
        }
    }
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search_images", post(search_images_upload))
        .route("/search-images", post(search_images))
        .route("/image-contains", post(image_contains))
        .route("/embed-text", post(embed_text))
        .route("/embed-image", post(embed_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str, max_upload_bytes: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, router(state, max_upload_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested, draining in-flight requests");
}

#[derive(Debug)]
pub struct HttpError(SearchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.class() {
            ErrorClass::ClientInput => StatusCode::BAD_REQUEST,
            ErrorClass::Backend | ErrorClass::Defect => {
                error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<SearchError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn invalid(message: impl Into<String>) -> HttpError {
    HttpError(SearchError::InvalidRequest(message.into()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| invalid(rejection.body_text()))
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, HttpError> {
    match value.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(invalid(format!("{field} is required"))),
    }
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    results: Vec<RankedResult>,
}

#[derive(Debug, Deserialize)]
struct SearchImagesRequest {
    query: Option<String>,
    images: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ImageContainsRequest {
    image: Option<String>,
    keyword: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageContainsResponse {
    result: bool,
    score: f32,
}

#[derive(Debug, Deserialize)]
struct EmbedTextRequest {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedImageRequest {
    image_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let provider = state.coordinator.provider();
    Json(json!({
        "status": "ok",
        "provider": provider.name(),
        "dimensions": provider.dimensions(),
    }))
}

/// Multipart search: `search_term` plus either a `pdf_file` or `image` parts.
#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn search_images_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<SearchResponse>, HttpError> {
    let mut search_term = None;
    let mut pdf_file: Option<(Option<String>, Vec<u8>)> = None;
    let mut images = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| invalid(error.body_text()))?
    {
        match field.name() {
            Some("search_term") => {
                search_term = Some(field.text().await.map_err(|error| invalid(error.body_text()))?);
            }
            Some("pdf_file") => {
                let name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(|error| invalid(error.body_text()))?;
                pdf_file = Some((name, bytes.to_vec()));
            }
            Some("image") => {
                let bytes = field.bytes().await.map_err(|error| invalid(error.body_text()))?;
                images.push(ImageSource::Bytes(bytes.to_vec()).load(&state.client).await?);
            }
            other => {
                warn!(field = other.unwrap_or("<unnamed>"), "ignoring unknown form field");
            }
        }
    }

    let query = required(&search_term, "search_term")?;

    let results = match (pdf_file, images.is_empty()) {
        (Some(_), false) => {
            return Err(invalid("send either pdf_file or image parts, not both"));
        }
        (Some((name, bytes)), true) => {
            if bytes.is_empty() {
                return Err(invalid("pdf_file is empty"));
            }
            let mut document = PdfDocument::from_bytes(bytes);
            if let Some(name) = name {
                document = document.with_name(name);
            }
            info!(query_len = query.len(), document = document.name().unwrap_or("<upload>"), "searching document");
            state.coordinator.search(query, &document).await?
        }
        (None, false) => {
            info!(query_len = query.len(), image_count = images.len(), "searching uploaded images");
            state
                .coordinator
                .rank_images(query, ExtractedImage::enumerate(images))
                .await?
        }
        (None, true) => return Err(invalid("pdf_file or image is required")),
    };

    info!(result_count = results.len(), "search complete");
    Ok(Json(SearchResponse { results }))
}

/// JSON search over directly supplied images (base64, data URI or URL).
#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn search_images(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SearchImagesRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let request = json_body(payload)?;
    let query = required(&request.query, "query")?;
    let sources = request.images.ok_or_else(|| invalid("images is required"))?;

    let mut images = Vec::with_capacity(sources.len());
    for source in &sources {
        images.push(load_image(&state, source).await?);
    }

    info!(query_len = query.len(), image_count = images.len(), "searching supplied images");
    let results = state
        .coordinator
        .rank_images(query, ExtractedImage::enumerate(images))
        .await?;

    info!(result_count = results.len(), "search complete");
    Ok(Json(SearchResponse { results }))
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn image_contains(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ImageContainsRequest>, JsonRejection>,
) -> Result<Json<ImageContainsResponse>, HttpError> {
    let request = json_body(payload)?;
    let source = required(&request.image, "image")?;
    let keyword = required(&request.keyword, "keyword")?;

    let image = load_image(&state, source).await?;
    let score = state.coordinator.containment_score(&image, keyword).await?;
    let result = exceeds_threshold(score, state.coordinator.config().containment_threshold);

    info!(keyword_len = keyword.len(), score, result, "containment checked");
    Ok(Json(ImageContainsResponse { result, score }))
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn embed_text(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EmbedTextRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, HttpError> {
    let request = json_body(payload)?;
    let text = required(&request.text, "text")?;
    let embedding = state.coordinator.provider().embed_text(text).await?;
    Ok(Json(EmbeddingResponse { embedding }))
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn embed_image(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EmbedImageRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, HttpError> {
    let request = json_body(payload)?;
    let source = required(&request.image_url, "image_url")?;
    let image = load_image(&state, source).await?;
    let embedding = state.coordinator.provider().embed_image(&image).await?;
    Ok(Json(EmbeddingResponse { embedding }))
}

async fn load_image(state: &AppState, field: &str) -> Result<RgbImage, SearchError> {
    ImageSource::from_field(field).load(&state.client).await
}

#[cfg(test)]
mod tests {
    use super::{router, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Request, StatusCode},
        Router,
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use image_search_core::{
        to_png_data_url, EmbeddingProvider, HashingEmbeddingProvider, ImageSearchCoordinator,
        LopdfImageExtractor, RemoteEmbeddingConfig, RemoteEmbeddingProvider, SearchConfig,
    };
    use lopdf::{dictionary, Document, Object, Stream};
    use serde_json::{json, Value};
    use std::io::Cursor;
    use std::sync::Arc;
    use tower::ServiceExt;

    const DIMENSIONS: usize = 64;
    const BOUNDARY: &str = "image-search-test-boundary";

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn app_with(config: SearchConfig) -> Router {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbeddingProvider::new(DIMENSIONS));
        let coordinator = ImageSearchCoordinator::new(LopdfImageExtractor, provider, config);
        router(Arc::new(AppState::new(coordinator)), 8 * 1024 * 1024)
    }

    fn app() -> Router {
        app_with(SearchConfig::default())
    }

    fn json_request(uri: &str, body: Value) -> Result<Request<Body>, axum::http::Error> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
    }

    fn multipart_request(parts: &[(&str, Option<&str>, Vec<u8>)]) -> Result<Request<Body>, axum::http::Error> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/search_images")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
    }

    async fn send(app: Router, request: Request<Body>) -> Result<(StatusCode, Value), Box<dyn std::error::Error>> {
        let response = app.oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, serde_json::from_slice(&bytes)?))
    }

    fn png_bytes(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }

    fn pdf_with_images(colors: &[[u8; 3]]) -> Result<Vec<u8>, lopdf::Error> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut xobjects = lopdf::Dictionary::new();
        for (position, color) in colors.iter().enumerate() {
            let samples: Vec<u8> = color.iter().copied().cycle().take(4 * 4 * 3).collect();
            let stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => 4,
                    "Height" => 4,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                },
                samples,
            );
            xobjects.set(format!("Im{position}"), doc.add_object(stream));
        }

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 100.into(), 100.into()],
            "Resources" => dictionary! { "XObject" => xobjects },
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        Ok(bytes)
    }

    fn assert_ranked(results: &Value, expected_len: usize) {
        let results = results.as_array().expect("results must be an array");
        assert_eq!(results.len(), expected_len);

        let mut indexes: Vec<u64> = results
            .iter()
            .map(|entry| entry["sourceIndex"].as_u64().expect("sourceIndex must be an integer"))
            .collect();
        let scores: Vec<f64> = results
            .iter()
            .map(|entry| entry["score"].as_f64().expect("score must be a number"))
            .collect();

        assert!(scores.windows(2).all(|pair| pair[0] >= pair[1]));
        indexes.sort_unstable();
        assert_eq!(indexes, (0..expected_len as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn health_reports_provider() -> TestResult {
        let request = Request::builder().uri("/health").body(Body::empty())?;
        let (status, body) = send(app(), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "provider": "hashing", "dimensions": DIMENSIONS}));
        Ok(())
    }

    #[tokio::test]
    async fn uploaded_pdf_is_searched() -> TestResult {
        let pdf = pdf_with_images(&[[255, 0, 0], [0, 255, 0], [0, 0, 255]])?;
        let request = multipart_request(&[
            ("search_term", None, b"red square".to_vec()),
            ("pdf_file", Some("figures.pdf"), pdf),
        ])?;

        let (status, body) = send(app(), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_ranked(&body["results"], 3);
        Ok(())
    }

    #[tokio::test]
    async fn uploaded_images_are_searched() -> TestResult {
        let request = multipart_request(&[
            ("search_term", None, b"sky".to_vec()),
            ("image", Some("a.png"), png_bytes(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 255])))?),
            ("image", Some("b.png"), png_bytes(&RgbImage::from_pixel(4, 4, Rgb([0, 255, 0])))?),
        ])?;

        let (status, body) = send(app(), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_ranked(&body["results"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn pdf_without_images_returns_empty_results() -> TestResult {
        let request = multipart_request(&[
            ("search_term", None, b"anything".to_vec()),
            ("pdf_file", Some("blank.pdf"), pdf_with_images(&[])?),
        ])?;

        let (status, body) = send(app(), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"results": []}));
        Ok(())
    }

    #[tokio::test]
    async fn upload_validation_errors_are_bad_requests() -> TestResult {
        let cases = vec![
            multipart_request(&[("pdf_file", Some("x.pdf"), pdf_with_images(&[[1, 2, 3]])?)])?,
            multipart_request(&[("search_term", None, b"cat".to_vec())])?,
            multipart_request(&[
                ("search_term", None, b"cat".to_vec()),
                ("pdf_file", Some("broken.pdf"), b"%PDF-1.4 truncated".to_vec()),
            ])?,
            multipart_request(&[
                ("search_term", None, b"cat".to_vec()),
                ("image", Some("a.png"), b"not an image".to_vec()),
            ])?,
        ];

        for request in cases {
            let (status, body) = send(app(), request).await?;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].as_str().is_some_and(|message| !message.is_empty()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn json_search_accepts_base64_and_data_urls() -> TestResult {
        let first = to_png_data_url(&RgbImage::from_pixel(3, 3, Rgb([200, 10, 10])))?;
        let second = first.trim_start_matches("data:image/png;base64,").to_string();
        let request = json_request("/search-images", json!({"query": "red", "images": [first, second]}))?;

        let (status, body) = send(app(), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_ranked(&body["results"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn json_search_honours_max_results() -> TestResult {
        let images: Vec<String> = [[1, 1, 1], [90, 90, 90], [250, 250, 250]]
            .into_iter()
            .map(|color| to_png_data_url(&RgbImage::from_pixel(2, 2, Rgb(color))))
            .collect::<Result<_, _>>()?;
        let request = json_request("/search-images", json!({"query": "grey", "images": images}))?;

        let (status, body) = send(app_with(SearchConfig::default().with_max_results(Some(1))), request).await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().map(Vec::len), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn json_errors_use_error_envelope() -> TestResult {
        let cases = vec![
            json_request("/search-images", json!({"images": []}))?,
            json_request("/search-images", json!({"query": "cat"}))?,
            json_request("/image-contains", json!({"image": "", "keyword": "cat"}))?,
            json_request("/image-contains", json!({"image": "@@@", "keyword": "cat"}))?,
            json_request("/embed-text", json!({}))?,
            Request::builder()
                .method("POST")
                .uri("/search-images")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))?,
        ];

        for request in cases {
            let (status, body) = send(app(), request).await?;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body["error"].is_string());
        }
        Ok(())
    }

    #[tokio::test]
    async fn image_contains_reports_score_and_decision() -> TestResult {
        let image = to_png_data_url(&RgbImage::from_pixel(4, 4, Rgb([30, 60, 90])))?;

        let permissive = app_with(SearchConfig::default().with_containment_threshold(-1.0));
        let (status, body) = send(
            permissive,
            json_request("/image-contains", json!({"image": image, "keyword": "boat"}))?,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], json!(true));
        assert!(body["score"].is_number());

        let strict = app_with(SearchConfig::default().with_containment_threshold(1.5));
        let (_, body) = send(
            strict,
            json_request("/image-contains", json!({"image": image, "keyword": "boat"}))?,
        )
        .await?;
        assert_eq!(body["result"], json!(false));
        Ok(())
    }

    #[tokio::test]
    async fn remote_provider_speaks_the_embedding_routes() -> TestResult {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let server = tokio::spawn(async move { axum::serve(listener, app()).await });

        let remote = RemoteEmbeddingProvider::new(RemoteEmbeddingConfig {
            endpoint: format!("http://{address}"),
            dimensions: DIMENSIONS,
            ..Default::default()
        })?;
        let local = HashingEmbeddingProvider::new(DIMENSIONS);
        let image = RgbImage::from_pixel(5, 5, Rgb([12, 200, 34]));

        let text = remote.embed_text("a lighthouse").await?;
        let expected = local.text_vector("a lighthouse");
        assert!(text.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));

        let pixels = remote.embed_image(&image).await?;
        let expected = local.image_vector(&image);
        assert!(pixels.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));

        server.abort();
        Ok(())
    }
}
