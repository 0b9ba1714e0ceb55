//! Persistent collection store: embedding-indexed records with exact filters
//!
//! A collection holds `(id, document, metadata, embedding)` records. All
//! embeddings in a collection share one dimensionality, recorded the first
//! time the collection is opened. Search is exact nearest-neighbour by cosine
//! distance (`1 - cos(a, b)`, range `[0, 2]`), restricted by a conjunction of
//! metadata equality constraints, with ties broken by insertion order.
//!
//! Backends:
//! - [`sqlite::SqliteCollection`]: single database file, ranking in Rust
//! - [`postgres::PgVectorCollection`]: PostgreSQL + pgvector `<=>` operator

pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{RecallError, RecallResult};

pub use self::postgres::PgVectorCollection;
pub use self::sqlite::SqliteCollection;

/// A primitive metadata value. Stores only hold scalars; richer session
/// fields are encoded before they get here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Int(i) => write!(f, "{i}"),
            MetadataValue::Float(x) => write!(f, "{x}"),
            MetadataValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(x: f64) -> Self {
        MetadataValue::Float(x)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A search hit: the record (without its embedding) plus its distance to the
/// query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub distance: f32,
}

/// Conjunction of exact equality constraints. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    constraints: BTreeMap<String, MetadataValue>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key == value`. A later constraint on the same key replaces
    /// the earlier one.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.constraints.iter()
    }

    /// Reject keys that cannot name a stored field.
    pub fn validate(&self) -> RecallResult<()> {
        for key in self.constraints.keys() {
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !valid {
                return Err(RecallError::invalid(format!(
                    "filter key {key:?} may only contain [A-Za-z0-9_.-]"
                )));
            }
        }
        Ok(())
    }

    /// JSON object form, used for JSONB containment.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.constraints).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Embedding-indexed record collection.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Dimensionality shared by every embedding in the collection.
    fn dimensions(&self) -> usize;

    /// Persist a new record. `DuplicateId` if the id already exists.
    async fn insert(&self, record: Record) -> RecallResult<()>;

    /// Full record, or `NotFound`.
    async fn get(&self, id: &str) -> RecallResult<Record>;

    /// Remove a record. `Ok(false)` when it was not present.
    async fn delete(&self, id: &str) -> RecallResult<bool>;

    /// Up to `k` matching records by ascending cosine distance.
    async fn search(
        &self,
        query: &[f32],
        filter: &MetadataFilter,
        k: usize,
    ) -> RecallResult<Vec<Hit>>;

    /// Up to `limit` matching records in insertion order, unranked.
    async fn scan(&self, filter: &MetadataFilter, limit: usize) -> RecallResult<Vec<Record>>;

    /// Number of records in the collection.
    async fn count(&self) -> RecallResult<u64>;

    /// Backend description, e.g. `"SQLite 3.45.1"`.
    async fn health(&self) -> RecallResult<String>;
}

/// Open the collection named in `config`, creating it on first use.
///
/// Fails with `Configuration` when the collection already exists with a
/// different dimensionality than `dimensions`.
pub async fn open_collection(
    config: &StoreConfig,
    dimensions: usize,
) -> RecallResult<Arc<dyn CollectionStore>> {
    match config.backend.as_str() {
        "sqlite" => {
            let path = config.expanded_path();
            let store = SqliteCollection::open(
                Path::new(&path),
                &config.collection,
                dimensions,
                config.max_connections,
            )
            .await?;
            Ok(Arc::new(store))
        }
        "pgvector" => {
            let pool = crate::db::create_pool(config).await?;
            let store =
                PgVectorCollection::open(pool, &config.namespace, &config.collection, dimensions)
                    .await?;
            Ok(Arc::new(store))
        }
        other => Err(RecallError::configuration(format!(
            "unknown store backend {other:?} (expected \"sqlite\" or \"pgvector\")"
        ))),
    }
}

/// Validate a vector about to be stored or searched with.
pub(crate) fn check_vector(vector: &[f32], dimensions: usize) -> RecallResult<()> {
    if vector.len() != dimensions {
        return Err(RecallError::invalid(format!(
            "vector has {} dimensions, collection expects {dimensions}",
            vector.len()
        )));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(RecallError::invalid("vector contains non-finite values"));
    }
    if norm(vector) == 0.0 {
        return Err(RecallError::invalid("zero vector has no direction"));
    }
    Ok(())
}

pub(crate) fn check_collection_name(name: &str) -> RecallResult<()> {
    if name.trim().is_empty() {
        return Err(RecallError::configuration("collection name must not be empty"));
    }
    Ok(())
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// `1 - cos(a, b)`. Callers guarantee equal length and non-zero norms.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let cos = dot / (norm(a) * norm(b));
    1.0 - cos.clamp(-1.0, 1.0)
}

/// Little-endian f32 blob.
pub(crate) fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Map a unique-constraint violation on insert to `DuplicateId`.
pub(crate) fn map_insert_error(err: sqlx::Error, id: &str) -> RecallError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RecallError::DuplicateId(id.to_string())
        }
        _ => RecallError::from(err),
    }
}
