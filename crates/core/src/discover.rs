use crate::error::SearchError;
use crate::models::ExtractedImage;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];

pub fn discover_image_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_image = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_image {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// Images loaded from a folder. `paths[i]` is the file behind the image
/// with `source_index == i`.
pub struct ImageCorpus {
    pub images: Vec<ExtractedImage>,
    pub paths: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedImage>,
}

pub fn load_image_folder(folder: &Path) -> Result<ImageCorpus, SearchError> {
    let files = discover_image_files(folder);

    if files.is_empty() {
        return Err(SearchError::InvalidRequest(format!(
            "no image files found in {}",
            folder.display()
        )));
    }

    let mut pixels = Vec::new();
    let mut paths = Vec::new();
    let mut skipped_files = Vec::new();

    for path in files {
        match image::open(&path) {
            Ok(decoded) => {
                pixels.push(decoded.to_rgb8());
                paths.push(path);
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable image");
                skipped_files.push(SkippedImage {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(ImageCorpus {
        images: ExtractedImage::enumerate(pixels),
        paths,
        skipped_files,
    })
}
