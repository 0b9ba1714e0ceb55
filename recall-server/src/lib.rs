pub mod http;
pub mod router;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use recall_core::embeddings::{create_backend, BackendConfig, EmbeddingBackend};
use recall_core::{open_collection, RecallConfig, SessionRepository};

/// State shared by the IPC and HTTP front-ends.
pub struct AppState {
    pub repo: SessionRepository,
    pub config: RecallConfig,
}

impl AppState {
    pub fn new(repo: SessionRepository, config: RecallConfig) -> Self {
        Self { repo, config }
    }

    /// Build the embedding provider, open the collection and wire the
    /// repository described by `config`.
    pub async fn from_config(config: RecallConfig) -> anyhow::Result<Arc<Self>> {
        let backend_config = BackendConfig::from_config(&config.embedding)
            .context("invalid [embedding] configuration")?;
        let embedder: Arc<dyn EmbeddingBackend> = Arc::from(
            create_backend(backend_config).context("failed to create embedding backend")?,
        );
        tracing::info!(
            backend = embedder.name(),
            dimensions = embedder.dimensions(),
            "Embedding backend ready"
        );

        let store = open_collection(&config.store, embedder.dimensions())
            .await
            .with_context(|| format!("failed to open {} store", config.store.backend))?;

        let repo = SessionRepository::new(
            store,
            embedder,
            Duration::from_secs(config.store.timeout_seconds),
        )?;

        Ok(Arc::new(Self::new(repo, config)))
    }
}
