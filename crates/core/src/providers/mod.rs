pub mod hashing;
pub mod remote;

pub use hashing::HashingEmbeddingProvider;
pub use remote::{RemoteEmbeddingConfig, RemoteEmbeddingProvider};
