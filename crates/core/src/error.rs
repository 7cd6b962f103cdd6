use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("pdf parse error: {0}")]
    DocumentParse(String),

    #[error("image decode error: {0}")]
    ImageDecode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("image fetch failed: {0}")]
    ImageFetch(String),

    #[error("{}", describe_mismatch(.expected, .found, .source_index))]
    DimensionMismatch {
        expected: usize,
        found: usize,
        source_index: Option<usize>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide between rejecting,
/// retrying and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ClientInput,
    Backend,
    Defect,
}

impl SearchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SearchError::DocumentParse(_)
            | SearchError::ImageDecode(_)
            | SearchError::InvalidRequest(_) => ErrorClass::ClientInput,
            SearchError::EmbeddingUnavailable(_)
            | SearchError::ImageFetch(_)
            | SearchError::Io(_) => ErrorClass::Backend,
            SearchError::DimensionMismatch { .. } => ErrorClass::Defect,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::EmbeddingUnavailable(_) | SearchError::ImageFetch(_)
        )
    }

    pub fn is_defect(&self) -> bool {
        self.class() == ErrorClass::Defect
    }
}

fn describe_mismatch(expected: &usize, found: &usize, source_index: &Option<usize>) -> String {
    match source_index {
        Some(index) => format!(
            "embedding dimension mismatch: query has {expected}, candidate {index} has {found}"
        ),
        None => format!("embedding dimension mismatch: expected {expected}, got {found}"),
    }
}

pub type Result<T, E = SearchError> = std::result::Result<T, E>;
