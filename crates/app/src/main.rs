mod config;
mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::EngineArgs;
use image_search_core::{
    load_image_folder, DocumentImageExtractor, ImageSource, PdfDocument,
};
use server::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "image-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "IMAGE_SEARCH_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
        /// Largest accepted request body, in megabytes.
        #[arg(long, env = "IMAGE_SEARCH_MAX_UPLOAD_MB", default_value = "100")]
        max_upload_mb: usize,
    },
    /// Rank the images inside a PDF against a text query.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        pdf: PathBuf,
    },
    /// Rank the image files under a folder against a text query.
    SearchDir {
        #[arg(long)]
        query: String,
        /// Folder searched recursively for image files.
        #[arg(long)]
        folder: PathBuf,
    },
    /// Decide whether an image depicts a keyword.
    Contains {
        /// Image file path, http(s) URL, data URI or base64.
        #[arg(long)]
        image: String,
        #[arg(long)]
        keyword: String,
    },
    /// Write every image the extractor finds in a PDF as PNG.
    Extract {
        #[arg(long)]
        pdf: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let coordinator = cli.engine.build_coordinator()?;

    info!(
        version = app_version,
        provider = coordinator.provider().name(),
        dimensions = coordinator.provider().dimensions(),
        started_at = %Utc::now().to_rfc3339(),
        "image-search boot"
    );

    match cli.command {
        Command::Serve {
            bind,
            max_upload_mb,
        } => {
            let state = Arc::new(AppState::new(coordinator));
            server::serve(state, &bind, max_upload_mb.saturating_mul(1024 * 1024)).await?;
        }
        Command::Search { query, pdf } => {
            let document = PdfDocument::open(&pdf)?;
            let images = coordinator.extractor().extract(&document)?;
            let pages: Vec<_> = images.iter().map(|image| image.page_number).collect();

            let results = coordinator.rank_images(&query, images).await?;

            println!("query: {query}");
            if results.is_empty() {
                println!("no images found in {}", pdf.display());
            }
            for (rank, result) in results.iter().enumerate() {
                let page = pages
                    .get(result.source_index)
                    .copied()
                    .flatten()
                    .map_or_else(|| "-".to_string(), |page| page.to_string());
                println!(
                    "[{}] score={:.4} source_index={} page={}",
                    rank + 1,
                    result.score,
                    result.source_index,
                    page
                );
            }
        }
        Command::SearchDir { query, folder } => {
            let corpus = load_image_folder(&folder)?;

            if !corpus.skipped_files.is_empty() {
                warn!(
                    skipped = corpus.skipped_files.len(),
                    folder = %folder.display(),
                    "skipped image files"
                );
                for skipped in &corpus.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped image");
                }
            }

            let results = coordinator.rank_images(&query, corpus.images).await?;

            println!("query: {query}");
            for (rank, result) in results.iter().enumerate() {
                let path = corpus
                    .paths
                    .get(result.source_index)
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                println!("[{}] score={:.4} {}", rank + 1, result.score, path);
            }
        }
        Command::Contains { image, keyword } => {
            let pixels = if Path::new(&image).is_file() {
                let bytes = tokio::fs::read(&image)
                    .await
                    .with_context(|| format!("reading {image}"))?;
                ImageSource::Bytes(bytes).load(&reqwest::Client::new()).await?
            } else {
                ImageSource::from_field(&image)
                    .load(&reqwest::Client::new())
                    .await?
            };

            let score = coordinator.containment_score(&pixels, &keyword).await?;
            let result =
                image_search_core::exceeds_threshold(score, coordinator.config().containment_threshold);
            println!("result={result} score={score:.4} keyword={keyword}");
        }
        Command::Extract { pdf, out_dir } => {
            let document = PdfDocument::open(&pdf)?;
            let images = coordinator.extractor().extract(&document)?;
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("creating {}", out_dir.display()))?;

            for image in &images {
                let page = image.page_number.unwrap_or(0);
                let target = out_dir.join(format!("img-{}-page-{}.png", image.source_index, page));
                image
                    .pixels
                    .save(&target)
                    .with_context(|| format!("writing {}", target.display()))?;
            }

            println!(
                "{} images extracted to {} at {}",
                images.len(),
                out_dir.display(),
                Utc::now().to_rfc3339()
            );
        }
    }

    Ok(())
}
