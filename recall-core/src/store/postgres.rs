//! PostgreSQL + pgvector collection backend
//!
//! Tables live in a configurable schema (`[store] namespace`). Filters compile
//! to JSONB containment (`metadata @> $filter`) and ranking is delegated to
//! pgvector's cosine-distance operator `<=>`, ties broken by `seq`.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;

use super::{
    check_collection_name, check_vector, map_insert_error, CollectionStore, Hit, Metadata,
    MetadataFilter, Record,
};
use crate::error::{RecallError, RecallResult};

type RecordRow = (String, String, serde_json::Value, Vector);
type HitRow = (String, String, serde_json::Value, f64);

#[derive(Debug, Clone)]
pub struct PgVectorCollection {
    pool: PgPool,
    namespace: String,
    name: String,
    dimensions: usize,
}

/// Schema names are interpolated into SQL, so only plain identifiers pass.
fn check_namespace(namespace: &str) -> RecallResult<()> {
    let mut chars = namespace.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && namespace.len() <= 63;
    if !valid {
        return Err(RecallError::configuration(format!(
            "namespace {namespace:?} is not a valid SQL identifier"
        )));
    }
    Ok(())
}

impl PgVectorCollection {
    pub async fn open(
        pool: PgPool,
        namespace: &str,
        name: &str,
        dimensions: usize,
    ) -> RecallResult<Self> {
        check_namespace(namespace)?;
        check_collection_name(name)?;
        if dimensions == 0 {
            return Err(RecallError::configuration("embedding dimensions must be positive"));
        }

        let collection = Self {
            pool,
            namespace: namespace.to_string(),
            name: name.to_string(),
            dimensions,
        };
        collection.migrate().await?;
        collection.register_dimensions().await?;

        tracing::info!(
            namespace = %collection.namespace,
            collection = %collection.name,
            dimensions,
            "pgvector collection opened"
        );
        Ok(collection)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let ns = &self.namespace;
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!("CREATE SCHEMA IF NOT EXISTS {ns}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {ns}.collections (
                    name        TEXT        PRIMARY KEY,
                    dimensions  INTEGER     NOT NULL,
                    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {ns}.records (
                    seq         BIGSERIAL   PRIMARY KEY,
                    collection  TEXT        NOT NULL REFERENCES {ns}.collections (name),
                    id          TEXT        NOT NULL,
                    document    TEXT        NOT NULL,
                    metadata    JSONB       NOT NULL DEFAULT '{{}}'::jsonb,
                    embedding   vector      NOT NULL,
                    UNIQUE (collection, id)
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS records_metadata_idx
                 ON {ns}.records USING gin (metadata jsonb_path_ops)"
            ),
        ];
        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn register_dimensions(&self) -> RecallResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {}.collections (name, dimensions) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
            self.namespace
        ))
        .bind(&self.name)
        .bind(self.dimensions as i32)
        .execute(&self.pool)
        .await?;

        let (stored,): (i32,) = sqlx::query_as(&format!(
            "SELECT dimensions FROM {}.collections WHERE name = $1",
            self.namespace
        ))
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;

        if stored as usize != self.dimensions {
            return Err(RecallError::configuration(format!(
                "collection {:?} stores {stored}-dimensional embeddings but the provider produces {}",
                self.name, self.dimensions
            )));
        }
        Ok(())
    }

    fn decode_metadata(id: &str, value: serde_json::Value) -> RecallResult<Metadata> {
        serde_json::from_value(value).map_err(|e| RecallError::CorruptRecord {
            id: id.to_string(),
            reason: format!("metadata is not a flat JSON object: {e}"),
        })
    }
}

#[async_trait]
impl CollectionStore for PgVectorCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn insert(&self, record: Record) -> RecallResult<()> {
        check_vector(&record.embedding, self.dimensions)?;
        let metadata = serde_json::to_value(&record.metadata)
            .map_err(|e| RecallError::invalid(format!("unserialisable metadata: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO {}.records (collection, id, document, metadata, embedding)
             VALUES ($1, $2, $3, $4, $5)",
            self.namespace
        ))
        .bind(&self.name)
        .bind(&record.id)
        .bind(&record.document)
        .bind(metadata)
        .bind(Vector::from(record.embedding.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &record.id))?;

        tracing::debug!(collection = %self.name, id = %record.id, "record inserted");
        Ok(())
    }

    async fn get(&self, id: &str) -> RecallResult<Record> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT id, document, metadata, embedding FROM {}.records
             WHERE collection = $1 AND id = $2",
            self.namespace
        ))
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let (id, document, metadata, embedding) =
            row.ok_or_else(|| RecallError::NotFound(id.to_string()))?;
        let metadata = Self::decode_metadata(&id, metadata)?;
        Ok(Record {
            id,
            document,
            metadata,
            embedding: embedding.to_vec(),
        })
    }

    async fn delete(&self, id: &str) -> RecallResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {}.records WHERE collection = $1 AND id = $2",
            self.namespace
        ))
        .bind(&self.name)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &MetadataFilter,
        k: usize,
    ) -> RecallResult<Vec<Hit>> {
        if k == 0 {
            return Err(RecallError::invalid("k must be at least 1"));
        }
        check_vector(query, self.dimensions)?;
        filter.validate()?;

        let rows: Vec<HitRow> = sqlx::query_as(&format!(
            "SELECT id, document, metadata, embedding <=> $1 AS distance
             FROM {}.records
             WHERE collection = $2 AND metadata @> $3
             ORDER BY embedding <=> $1, seq
             LIMIT $4",
            self.namespace
        ))
        .bind(Vector::from(query.to_vec()))
        .bind(&self.name)
        .bind(filter.to_json())
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, document, metadata, distance)| {
                let metadata = Self::decode_metadata(&id, metadata)?;
                Ok(Hit {
                    id,
                    document,
                    metadata,
                    distance: distance as f32,
                })
            })
            .collect()
    }

    async fn scan(&self, filter: &MetadataFilter, limit: usize) -> RecallResult<Vec<Record>> {
        filter.validate()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT id, document, metadata, embedding FROM {}.records
             WHERE collection = $1 AND metadata @> $2
             ORDER BY seq
             LIMIT $3",
            self.namespace
        ))
        .bind(&self.name)
        .bind(filter.to_json())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, document, metadata, embedding)| {
                let metadata = Self::decode_metadata(&id, metadata)?;
                Ok(Record {
                    id,
                    document,
                    metadata,
                    embedding: embedding.to_vec(),
                })
            })
            .collect()
    }

    async fn count(&self) -> RecallResult<u64> {
        let (n,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {}.records WHERE collection = $1",
            self.namespace
        ))
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(n as u64)
    }

    async fn health(&self) -> RecallResult<String> {
        let version = crate::db::health_check(&self.pool).await?;
        let pgvector = crate::db::check_pgvector(&self.pool).await?;
        Ok(format!("{version} (pgvector {pgvector})"))
    }
}
