//! SQLite collection backend
//!
//! Every collection lives in one database file (WAL journal). Embeddings are
//! stored as little-endian f32 blobs; metadata as a JSON object so filters
//! compile to `json_extract` equality. Ranking is exact cosine distance in
//! Rust over the filtered rows.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{
    check_collection_name, check_vector, cosine_distance, decode_embedding, encode_embedding,
    map_insert_error, CollectionStore, Hit, Metadata, MetadataFilter, MetadataValue, Record,
};
use crate::error::{RecallError, RecallResult};

type RecordRow = (i64, String, String, String, Vec<u8>);

#[derive(Debug, Clone)]
pub struct SqliteCollection {
    pool: SqlitePool,
    name: String,
    dimensions: usize,
}

impl SqliteCollection {
    /// Open (creating if needed) the database at `path` and the named
    /// collection inside it.
    pub async fn open(
        path: &Path,
        name: &str,
        dimensions: usize,
        max_connections: u32,
    ) -> RecallResult<Self> {
        check_collection_name(name)?;
        if dimensions == 0 {
            return Err(RecallError::configuration("embedding dimensions must be positive"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let collection = Self {
            pool,
            name: name.to_string(),
            dimensions,
        };
        collection.migrate().await?;
        collection.register_dimensions().await?;

        tracing::info!(
            path = %path.display(),
            collection = %collection.name,
            dimensions,
            "SQLite collection opened"
        );
        Ok(collection)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS collections (
                name        TEXT    PRIMARY KEY,
                dimensions  INTEGER NOT NULL,
                created_at  TEXT    NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                collection  TEXT    NOT NULL,
                id          TEXT    NOT NULL,
                document    TEXT    NOT NULL,
                metadata    TEXT    NOT NULL,
                embedding   BLOB    NOT NULL,
                UNIQUE (collection, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn register_dimensions(&self) -> RecallResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, dimensions, created_at) VALUES (?, ?, ?)",
        )
        .bind(&self.name)
        .bind(self.dimensions as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let (stored,): (i64,) = sqlx::query_as("SELECT dimensions FROM collections WHERE name = ?")
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

    /// `SELECT ... WHERE collection = ? AND <filter>` in insertion order.
    fn select_filtered<'a>(&'a self, filter: &'a MetadataFilter) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::new(
            "SELECT seq, id, document, metadata, embedding FROM records WHERE collection = ",
        );
        qb.push_bind(&self.name);
        for (key, value) in filter.iter() {
            qb.push(" AND json_extract(metadata, ");
            qb.push_bind(format!("$.\"{key}\""));
            qb.push(") = ");
            match value {
                MetadataValue::Int(i) => qb.push_bind(*i),
                MetadataValue::Float(x) => qb.push_bind(*x),
                MetadataValue::Str(s) => qb.push_bind(s.as_str()),
            };
        }
        qb.push(" ORDER BY seq");
        qb
    }

    fn decode_row(&self, row: RecordRow) -> RecallResult<(i64, Record)> {
        let (seq, id, document, metadata, blob) = row;
        let metadata: Metadata =
            serde_json::from_str(&metadata).map_err(|e| RecallError::CorruptRecord {
                id: id.clone(),
                reason: format!("metadata is not a flat JSON object: {e}"),
            })?;
        let embedding = decode_embedding(&blob)
            .filter(|v| v.len() == self.dimensions)
            .ok_or_else(|| RecallError::CorruptRecord {
                id: id.clone(),
                reason: format!(
                    "embedding blob of {} bytes does not hold {} f32 values",
                    blob.len(),
                    self.dimensions
                ),
            })?;
        Ok((
            seq,
            Record {
                id,
                document,
                metadata,
                embedding,
            },
        ))
    }
}

#[async_trait]
impl CollectionStore for SqliteCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn insert(&self, record: Record) -> RecallResult<()> {
        check_vector(&record.embedding, self.dimensions)?;
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| RecallError::invalid(format!("unserialisable metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO records (collection, id, document, metadata, embedding)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.name)
        .bind(&record.id)
        .bind(&record.document)
        .bind(metadata)
        .bind(encode_embedding(&record.embedding))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &record.id))?;

        tracing::debug!(collection = %self.name, id = %record.id, "record inserted");
        Ok(())
    }

    async fn get(&self, id: &str) -> RecallResult<Record> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT seq, id, document, metadata, embedding FROM records
             WHERE collection = ? AND id = ?",
        )
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.decode_row(row)?.1),
            None => Err(RecallError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> RecallResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND id = ?")
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

        let rows: Vec<RecordRow> = self
            .select_filtered(filter)
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let (seq, record) = self.decode_row(row)?;
            let distance = cosine_distance(query, &record.embedding);
            scored.push((distance, seq, record));
        }
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, _, r)| Hit {
                id: r.id,
                document: r.document,
                metadata: r.metadata,
                distance,
            })
            .collect())
    }

    async fn scan(&self, filter: &MetadataFilter, limit: usize) -> RecallResult<Vec<Record>> {
        filter.validate()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb = self.select_filtered(filter);
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<RecordRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| self.decode_row(row).map(|(_, r)| r))
            .collect()
    }

    async fn count(&self) -> RecallResult<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn health(&self) -> RecallResult<String> {
        let (version,): (String,) = sqlx::query_as("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(format!("SQLite {version}"))
    }
}
