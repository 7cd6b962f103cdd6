use crate::error::SearchError;

/// Runs CPU-bound decoding on the blocking pool so it does not stall the
/// runtime's async workers.
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, SearchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SearchError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|error| {
            SearchError::Io(std::io::Error::other(format!(
                "decoding task join error: {error}"
            )))
        })?
}
