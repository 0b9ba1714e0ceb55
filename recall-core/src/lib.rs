pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod hash_embedder;
pub mod ipc;
pub mod models;
pub mod onnx_embedder;
pub mod ranking;
pub mod repository;
pub mod store;

pub use config::RecallConfig;
pub use embeddings::{
    create_backend, BackendConfig, EmbeddingBackend, EmbeddingError, OnnxConfig, OpenAiConfig,
    OpenAiEmbeddingClient, HASH_DIMENSIONS, ONNX_DIMENSIONS,
};
pub use error::{ErrorKind, RecallError, RecallResult};
pub use hash_embedder::HashEmbeddingClient;
pub use models::{QueryResult, Session, SessionMetadata, SessionSummary};
pub use onnx_embedder::OnnxEmbeddingClient;
pub use repository::{ContextOptions, SessionDraft, SessionFilter, SessionQuery, SessionRepository};
pub use store::{open_collection, CollectionStore, MetadataFilter, MetadataValue};
