//! Session repository: session semantics over a collection store
//!
//! Owns the store and the embedding provider (both behind `Arc`, shared by
//! every front-end) and adds id generation, default timestamps, message
//! counting, typed metadata, relevance thresholding and bounded waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embeddings::EmbeddingBackend;
use crate::error::{ErrorKind, RecallError, RecallResult};
use crate::models::session::{count_messages, now_micros, STATUS_COMPLETED};
use crate::models::{QueryResult, Session, SessionMetadata, SessionSummary};
use crate::ranking::{format_context, relevance_from_distance, DEFAULT_EXCERPT_CHARS, DEFAULT_HEADER};
use crate::store::{CollectionStore, MetadataFilter, Record};

/// Assumed session length when the caller gives no start time. An estimate,
/// not a measurement.
pub const ESTIMATED_SESSION_MINUTES: i64 = 30;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_RESULTS: usize = 5;

/// Workflow recorded when none is given.
pub const NO_WORKFLOW: &str = "none";

/// Default extra time an overrunning insert gets before `save` gives up on it.
/// Longer than the SQLite busy timeout, so a queued write always resolves.
pub const INSERT_SETTLE: Duration = Duration::from_secs(10);

/// Fresh ids tried when an insert collides.
const MAX_ID_ATTEMPTS: usize = 3;

/// `{YYYY-MM-DD}-{agent_name}-{6 hex chars}`
pub fn generate_id(agent_name: &str, now: &DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", now.format("%Y-%m-%d"), agent_name, &suffix[..6])
}

/// Default `start_time` for a session ending at `end`.
pub fn estimated_start(end: DateTime<Utc>) -> DateTime<Utc> {
    end - chrono::Duration::minutes(ESTIMATED_SESSION_MINUTES)
}

fn default_workflow() -> String {
    NO_WORKFLOW.to_string()
}

/// A session about to be saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDraft {
    pub document: String,
    pub agent_name: String,
    pub agent_persona: String,
    pub project_name: String,
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub artifacts_created: Vec<String>,
}

impl SessionDraft {
    pub fn new(
        document: impl Into<String>,
        agent_name: impl Into<String>,
        agent_persona: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            document: document.into(),
            agent_name: agent_name.into(),
            agent_persona: agent_persona.into(),
            project_name: project_name.into(),
            workflow: default_workflow(),
            start_time: None,
            end_time: None,
            topics: Vec::new(),
            artifacts_created: Vec::new(),
        }
    }

    pub fn workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn start_time(mut self, t: DateTime<Utc>) -> Self {
        self.start_time = Some(t);
        self
    }

    pub fn end_time(mut self, t: DateTime<Utc>) -> Self {
        self.end_time = Some(t);
        self
    }

    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts_created = artifacts;
        self
    }
}

/// Optional exact-match constraints. `None` and empty strings are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

impl SessionFilter {
    pub fn to_metadata_filter(&self) -> MetadataFilter {
        use crate::models::session::keys;

        [
            (keys::AGENT_NAME, &self.agent_name),
            (keys::WORKFLOW, &self.workflow),
            (keys::PROJECT_NAME, &self.project_name),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_deref().filter(|s| !s.is_empty()).map(|s| (k, s)))
        .fold(MetadataFilter::new(), |f, (k, v)| f.eq(k, v))
    }
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionQuery {
    pub text: String,
    #[serde(flatten)]
    pub filter: SessionFilter,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub min_relevance: f32,
}

impl SessionQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filter: SessionFilter::default(),
            max_results: DEFAULT_MAX_RESULTS,
            min_relevance: 0.0,
        }
    }

    pub fn agent(mut self, agent_name: impl Into<String>) -> Self {
        self.filter.agent_name = Some(agent_name.into());
        self
    }

    pub fn workflow(mut self, workflow: impl Into<String>) -> Self {
        self.filter.workflow = Some(workflow.into());
        self
    }

    pub fn project(mut self, project_name: impl Into<String>) -> Self {
        self.filter.project_name = Some(project_name.into());
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn min_relevance(mut self, threshold: f32) -> Self {
        self.min_relevance = threshold;
        self
    }
}

/// Rendering options for [`SessionRepository::context`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub header: String,
    pub max_chars: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.to_string(),
            max_chars: DEFAULT_EXCERPT_CHARS,
        }
    }
}

pub struct SessionRepository {
    store: Arc<dyn CollectionStore>,
    embedder: Arc<dyn EmbeddingBackend>,
    timeout: Duration,
    insert_settle: Duration,
}

impl std::fmt::Debug for SessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository")
            .field("collection", &self.store.name())
            .field("embedder", &self.embedder.name())
            .field("timeout", &self.timeout)
            .field("insert_settle", &self.insert_settle)
            .finish()
    }
}

impl SessionRepository {
    /// The store and the provider must agree on dimensionality.
    pub fn new(
        store: Arc<dyn CollectionStore>,
        embedder: Arc<dyn EmbeddingBackend>,
        timeout: Duration,
    ) -> RecallResult<Self> {
        if store.dimensions() != embedder.dimensions() {
            return Err(RecallError::configuration(format!(
                "collection {:?} holds {}-dimensional embeddings but provider {} produces {}",
                store.name(),
                store.dimensions(),
                embedder.name(),
                embedder.dimensions()
            )));
        }
        Ok(Self {
            store,
            embedder,
            timeout,
            insert_settle: INSERT_SETTLE,
        })
    }

    /// Override [`INSERT_SETTLE`].
    pub fn with_insert_settle(mut self, settle: Duration) -> Self {
        self.insert_settle = settle;
        self
    }

    pub fn collection(&self) -> &str {
        self.store.name()
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn dimensions(&self) -> usize {
        self.store.dimensions()
    }

    async fn bounded<T, E, F>(&self, operation: &'static str, fut: F) -> RecallResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<RecallError>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(RecallError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    /// Insert bounded by the repository timeout. An insert that overruns is
    /// kept running for the settle window and then looked up, so a
    /// `Timeout` from `save` is only reported when the record did not land.
    async fn insert_settled(&self, record: &Record) -> RecallResult<()> {
        let mut insert = self.store.insert(record.clone());
        if let Ok(result) = tokio::time::timeout(self.timeout, &mut insert).await {
            return result;
        }

        tracing::warn!(
            session_id = %record.id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Insert overran timeout, waiting for its outcome"
        );
        match tokio::time::timeout(self.insert_settle, &mut insert).await {
            Ok(result) => result,
            Err(_) => match self.bounded("confirm insert", self.store.get(&record.id)).await {
                Ok(_) => Ok(()),
                Err(_) => Err(RecallError::Timeout {
                    operation: "insert session",
                    after: self.timeout,
                }),
            },
        }
    }

    /// Persist a session and return its id.
    pub async fn save(&self, draft: SessionDraft) -> RecallResult<String> {
        if draft.document.trim().is_empty() {
            return Err(RecallError::invalid("session document must not be empty"));
        }
        if draft.agent_name.trim().is_empty() {
            return Err(RecallError::invalid("agent_name must not be empty"));
        }
        // The agent name is embedded in the id, which travels as a URL path segment
        if let Some(c) = draft
            .agent_name
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#' | '%'))
        {
            return Err(RecallError::invalid(format!(
                "agent_name {:?} must not contain {c:?}",
                draft.agent_name
            )));
        }

        let now = now_micros();
        let end_time = draft.end_time.map(|t| t.trunc_subsecs(6)).unwrap_or(now);
        let start_time = draft
            .start_time
            .map(|t| t.trunc_subsecs(6))
            .unwrap_or_else(|| estimated_start(end_time));
        let workflow = if draft.workflow.is_empty() {
            default_workflow()
        } else {
            draft.workflow
        };

        let metadata = SessionMetadata {
            message_count: count_messages(&draft.document),
            agent_name: draft.agent_name,
            agent_persona: draft.agent_persona,
            workflow,
            project_name: draft.project_name,
            start_time,
            end_time,
            topics: draft.topics,
            artifacts_created: draft.artifacts_created,
            session_status: STATUS_COMPLETED.to_string(),
        };

        let embedding = self
            .bounded("embed document", self.embedder.embed(&draft.document))
            .await
            .map_err(|e| e.context("save session"))?;

        let mut record = Record {
            id: String::new(),
            document: draft.document,
            metadata: metadata.to_metadata(),
            embedding,
        };

        let mut attempt = 1;
        loop {
            record.id = generate_id(&metadata.agent_name, &now);
            let id = record.id.clone();
            match self.insert_settled(&record).await {
                Ok(()) => {
                    tracing::info!(
                        session_id = %id,
                        agent = %metadata.agent_name,
                        workflow = %metadata.workflow,
                        message_count = metadata.message_count,
                        "Session saved"
                    );
                    return Ok(id);
                }
                Err(e) if e.kind() == ErrorKind::DuplicateId && attempt < MAX_ID_ATTEMPTS => {
                    tracing::warn!(session_id = %id, attempt, "Session id collision, regenerating");
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("save session {id}"))),
            }
        }
    }

    /// Ranked sessions for `query`, most similar first.
    ///
    /// The relevance threshold is applied after the top-`max_results` cut, so
    /// fewer than `max_results` sessions may come back.
    pub async fn query(&self, query: &SessionQuery) -> RecallResult<Vec<QueryResult>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RecallError::invalid("query text must not be empty"));
        }
        if !query.min_relevance.is_finite() {
            return Err(RecallError::invalid("min_relevance must be a finite number"));
        }
        if query.max_results == 0 {
            return Err(RecallError::invalid("max_results must be at least 1"));
        }

        let filter = query.filter.to_metadata_filter();
        let vector = self
            .bounded("embed query", self.embedder.embed_query(text))
            .await
            .map_err(|e| e.context("query sessions"))?;
        let hits = self
            .bounded(
                "search sessions",
                self.store.search(&vector, &filter, query.max_results),
            )
            .await
            .map_err(|e| e.context("query sessions"))?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let relevance_score = relevance_from_distance(hit.distance);
            if relevance_score < query.min_relevance {
                continue;
            }
            let metadata = SessionMetadata::from_metadata(&hit.id, &hit.metadata)
                .map_err(|e| e.context("query sessions"))?;
            results.push(QueryResult {
                session_id: hit.id,
                document: hit.document,
                metadata,
                distance: hit.distance,
                relevance_score,
            });
        }

        tracing::debug!(
            query = %text,
            results = results.len(),
            min_relevance = query.min_relevance,
            "Sessions queried"
        );
        Ok(results)
    }

    /// [`query`](Self::query) rendered as a context block; `""` when nothing
    /// clears the threshold.
    pub async fn context(
        &self,
        query: &SessionQuery,
        options: &ContextOptions,
    ) -> RecallResult<String> {
        let results = self.query(query).await?;
        Ok(format_context(&results, &options.header, options.max_chars))
    }

    /// Metadata of up to `limit` sessions in insertion order.
    pub async fn list(
        &self,
        filter: &SessionFilter,
        limit: usize,
    ) -> RecallResult<Vec<SessionSummary>> {
        let records = self
            .bounded("list sessions", self.store.scan(&filter.to_metadata_filter(), limit))
            .await
            .map_err(|e| e.context("list sessions"))?;

        records
            .into_iter()
            .map(|r| {
                let metadata = SessionMetadata::from_metadata(&r.id, &r.metadata)
                    .map_err(|e| e.context("list sessions"))?;
                Ok(SessionSummary {
                    session_id: r.id,
                    metadata,
                })
            })
            .collect()
    }

    /// `NotFound` is returned as-is so callers can match on it directly.
    pub async fn get_by_id(&self, id: &str) -> RecallResult<Session> {
        let record = match self.bounded("get session", self.store.get(id)).await {
            Ok(r) => r,
            Err(e @ RecallError::NotFound(_)) => return Err(e),
            Err(e) => return Err(e.context(format!("get session {id}"))),
        };
        let metadata = SessionMetadata::from_metadata(&record.id, &record.metadata)?;
        Ok(Session {
            id: record.id,
            document: record.document,
            metadata,
        })
    }

    /// `Ok(false)` when no such session exists.
    pub async fn delete_by_id(&self, id: &str) -> RecallResult<bool> {
        let deleted = self
            .bounded("delete session", self.store.delete(id))
            .await
            .map_err(|e| e.context(format!("delete session {id}")))?;
        if deleted {
            tracing::info!(session_id = %id, "Session deleted");
        }
        Ok(deleted)
    }

    pub async fn count(&self) -> RecallResult<u64> {
        self.bounded("count sessions", self.store.count())
            .await
            .map_err(|e| e.context("count sessions"))
    }

    /// Backend description for health reporting.
    pub async fn health(&self) -> RecallResult<String> {
        self.bounded("store health", self.store.health())
            .await
            .map_err(|e| e.context("store health"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingError;
    use crate::hash_embedder::HashEmbeddingClient;
    use crate::store::{Hit, SqliteCollection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIMS: usize = 384;

    async fn repo_with(
        timeout: Duration,
    ) -> (tempfile::TempDir, Arc<dyn CollectionStore>, SessionRepository) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CollectionStore> = Arc::new(
            SqliteCollection::open(&dir.path().join("sessions.db"), "sessions", DIMS, 4)
                .await
                .unwrap(),
        );
        let embedder = Arc::new(HashEmbeddingClient::new(DIMS).unwrap());
        let repo = SessionRepository::new(store.clone(), embedder, timeout).unwrap();
        (dir, store, repo)
    }

    async fn repo() -> (tempfile::TempDir, SessionRepository) {
        let (dir, _, repo) = repo_with(DEFAULT_TIMEOUT).await;
        (dir, repo)
    }

    #[test]
    fn test_generate_id_shape() {
        let now = DateTime::parse_from_rfc3339("2025-01-15T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_id("architect", &now);
        assert!(id.starts_with("2025-01-15-architect-"), "got: {id}");
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_id("architect", &now), generate_id("architect", &now));
    }

    #[test]
    fn test_session_filter_ignores_empty_values() {
        let filter = SessionFilter {
            agent_name: Some("architect".into()),
            workflow: Some(String::new()),
            project_name: None,
        };
        let expected = MetadataFilter::new().eq("agent_name", "architect");
        assert_eq!(filter.to_metadata_filter(), expected);
        assert!(SessionFilter::default().to_metadata_filter().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_get_roundtrip() {
        let (_dir, repo) = repo().await;
        let start = DateTime::parse_from_rfc3339("2025-01-15T14:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2025-01-15T14:45:30.250000Z")
            .unwrap()
            .with_timezone(&Utc);

        let draft = SessionDraft::new(
            "User: caching?\nAssistant: Redis.\nUser: thanks",
            "architect",
            "Winston",
            "MyProject",
        )
        .workflow("create-architecture")
        .start_time(start)
        .end_time(end)
        .topics(vec!["caching".into(), "redis".into()])
        .artifacts(vec!["architecture.md".into()]);

        let id = repo.save(draft).await.unwrap();
        assert!(id.contains("-architect-"));

        let session = repo.get_by_id(&id).await.unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.document, "User: caching?\nAssistant: Redis.\nUser: thanks");
        let m = &session.metadata;
        assert_eq!(m.agent_name, "architect");
        assert_eq!(m.agent_persona, "Winston");
        assert_eq!(m.workflow, "create-architecture");
        assert_eq!(m.project_name, "MyProject");
        assert_eq!(m.start_time, start);
        assert_eq!(m.end_time, end);
        assert_eq!(m.message_count, 3);
        assert_eq!(m.topics, vec!["caching", "redis"]);
        assert_eq!(m.artifacts_created, vec!["architecture.md"]);
        assert_eq!(m.session_status, "completed");
    }

    #[tokio::test]
    async fn test_default_timestamps_and_workflow() {
        let (_dir, repo) = repo().await;
        let before = Utc::now();
        let id = repo
            .save(SessionDraft::new("User: hi", "pm", "John", "default"))
            .await
            .unwrap();
        let after = Utc::now();

        let m = repo.get_by_id(&id).await.unwrap().metadata;
        assert!(m.end_time >= before - chrono::Duration::microseconds(1));
        assert!(m.end_time <= after);
        assert_eq!(m.end_time - m.start_time, chrono::Duration::minutes(30));
        assert_eq!(m.workflow, "none");
        assert!(m.topics.is_empty());
        assert!(m.artifacts_created.is_empty());
    }

    #[tokio::test]
    async fn test_save_rejects_empty_document() {
        let (_dir, repo) = repo().await;
        let err = repo
            .save(SessionDraft::new("  \n ", "pm", "John", "default"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    async fn seed_caching_scenario(repo: &SessionRepository) -> (String, String) {
        let architect = repo
            .save(SessionDraft::new("Hello world about caching", "architect", "Winston", "MyProject"))
            .await
            .unwrap();
        let pm = repo
            .save(SessionDraft::new("Budget planning meeting", "pm", "John", "MyProject"))
            .await
            .unwrap();
        (architect, pm)
    }

    #[tokio::test]
    async fn test_caching_query_ranks_architect_first() {
        let (_dir, repo) = repo().await;
        let (architect, pm) = seed_caching_scenario(&repo).await;

        let results = repo
            .query(&SessionQuery::new("caching strategies"))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].session_id, architect);
        assert_eq!(results[1].session_id, pm);
        assert!(results[0].relevance_score > results[1].relevance_score);
        for r in &results {
            assert!((r.relevance_score - (1.0 - r.distance)).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_filter_with_no_matching_agent() {
        let (_dir, repo) = repo().await;
        seed_caching_scenario(&repo).await;

        let query = SessionQuery::new("caching strategies").agent("qa");
        assert!(repo.query(&query).await.unwrap().is_empty());
        let context = repo.context(&query, &ContextOptions::default()).await.unwrap();
        assert_eq!(context, "");
    }

    #[tokio::test]
    async fn test_filter_restricts_to_agent() {
        let (_dir, repo) = repo().await;
        let (architect, _) = seed_caching_scenario(&repo).await;

        let results = repo
            .query(&SessionQuery::new("budget").agent("architect"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, architect);
        assert!(results.iter().all(|r| r.metadata.agent_name == "architect"));
    }

    async fn seed_graded(repo: &SessionRepository) {
        for doc in [
            "Budget planning meeting",
            "Hello world about caching",
            "User: caching strategies",
            "caching strategies for redis clusters",
            "User: sprint retrospective notes",
        ] {
            repo.save(SessionDraft::new(doc, "architect", "Winston", "MyProject"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_relevance_non_increasing() {
        let (_dir, repo) = repo().await;
        seed_graded(&repo).await;

        let results = repo
            .query(&SessionQuery::new("caching strategies").max_results(10))
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results
            .windows(2)
            .all(|w| w[0].relevance_score >= w[1].relevance_score));
        assert_eq!(results[0].document, "User: caching strategies");
    }

    #[tokio::test]
    async fn test_threshold_law_and_monotonicity() {
        let (_dir, repo) = repo().await;
        seed_graded(&repo).await;

        let base = SessionQuery::new("caching strategies").max_results(10);
        let mut previous: Option<Vec<String>> = None;
        for threshold in [-1.0, 0.0, 0.3, 0.5, 0.7, 0.9] {
            let results = repo
                .query(&base.clone().min_relevance(threshold))
                .await
                .unwrap();
            assert!(results.iter().all(|r| r.relevance_score >= threshold));

            let ids: Vec<String> = results.into_iter().map(|r| r.session_id).collect();
            if let Some(prev) = &previous {
                assert!(ids.iter().all(|id| prev.contains(id)));
                assert!(ids.len() <= prev.len());
            }
            previous = Some(ids);
        }

        let strict = repo.query(&base.clone().min_relevance(0.5)).await.unwrap();
        assert_eq!(strict.len(), 2);
    }

    #[tokio::test]
    async fn test_threshold_applies_after_top_k() {
        let (_dir, repo) = repo().await;
        seed_graded(&repo).await;

        // top-3 includes one session below 0.5, which is then dropped
        let results = repo
            .query(&SessionQuery::new("caching strategies").max_results(3).min_relevance(0.5))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_query_rejects_bad_input() {
        let (_dir, repo) = repo().await;
        let err = repo.query(&SessionQuery::new("   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = repo
            .query(&SessionQuery::new("caching").min_relevance(f32::NAN))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = repo
            .query(&SessionQuery::new("caching").max_results(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, repo) = repo().await;
        let (architect, _) = seed_caching_scenario(&repo).await;

        assert!(repo.delete_by_id(&architect).await.unwrap());
        assert!(!repo.delete_by_id(&architect).await.unwrap());

        let err = repo.get_by_id(&architect).await.unwrap_err();
        assert!(matches!(err, RecallError::NotFound(_)));

        let results = repo
            .query(&SessionQuery::new("caching strategies"))
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.session_id != architect));
    }

    #[tokio::test]
    async fn test_list_with_filter_and_limit() {
        let (_dir, repo) = repo().await;
        let (architect, pm) = seed_caching_scenario(&repo).await;

        let all = repo.list(&SessionFilter::default(), 10).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.session_id.clone()).collect();
        assert_eq!(ids, vec![architect.clone(), pm]);

        let only_architect = repo
            .list(
                &SessionFilter {
                    agent_name: Some("architect".into()),
                    ..SessionFilter::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(only_architect.len(), 1);
        assert_eq!(only_architect[0].session_id, architect);

        assert_eq!(repo.list(&SessionFilter::default(), 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves() {
        let (_dir, repo) = repo().await;
        let repo = Arc::new(repo);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let repo = Arc::clone(&repo);
                tokio::spawn(async move {
                    repo.save(SessionDraft::new(
                        format!("User: concurrent session {i}"),
                        "dev",
                        "Amelia",
                        "MyProject",
                    ))
                    .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert_eq!(repo.count().await.unwrap(), 10);
    }

    struct StalledEmbedder;

    #[async_trait]
    impl EmbeddingBackend for StalledEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0; DIMS])
        }

        fn dimensions(&self) -> usize {
            DIMS
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out() {
        let (_dir, store, _) = repo_with(DEFAULT_TIMEOUT).await;
        let repo =
            SessionRepository::new(store, Arc::new(StalledEmbedder), Duration::from_millis(50))
                .unwrap();

        let err = repo
            .save(SessionDraft::new("User: hi", "pm", "John", "default"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("embed document timed out after 50ms"));

        let err = repo.query(&SessionQuery::new("hi")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let (_dir, store, _) = repo_with(DEFAULT_TIMEOUT).await;
        let small = Arc::new(HashEmbeddingClient::new(16).unwrap());
        let err = SessionRepository::new(store, small, DEFAULT_TIMEOUT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    /// Rejects the first insert as a duplicate, then delegates.
    struct CollidingStore {
        inner: Arc<dyn CollectionStore>,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl CollectionStore for CollidingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        async fn insert(&self, record: Record) -> RecallResult<()> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(RecallError::DuplicateId(record.id));
            }
            self.inner.insert(record).await
        }
        async fn get(&self, id: &str) -> RecallResult<Record> {
            self.inner.get(id).await
        }
        async fn delete(&self, id: &str) -> RecallResult<bool> {
            self.inner.delete(id).await
        }
        async fn search(
            &self,
            query: &[f32],
            filter: &MetadataFilter,
            k: usize,
        ) -> RecallResult<Vec<Hit>> {
            self.inner.search(query, filter, k).await
        }
        async fn scan(&self, filter: &MetadataFilter, limit: usize) -> RecallResult<Vec<Record>> {
            self.inner.scan(filter, limit).await
        }
        async fn count(&self) -> RecallResult<u64> {
            self.inner.count().await
        }
        async fn health(&self) -> RecallResult<String> {
            self.inner.health().await
        }
    }

    #[tokio::test]
    async fn test_id_collision_regenerates_id() {
        let (_dir, inner, _) = repo_with(DEFAULT_TIMEOUT).await;
        let store = Arc::new(CollidingStore {
            inner,
            inserts: AtomicUsize::new(0),
        });
        let repo = SessionRepository::new(
            store.clone(),
            Arc::new(HashEmbeddingClient::new(DIMS).unwrap()),
            DEFAULT_TIMEOUT,
        )
        .unwrap();

        let id = repo
            .save(SessionDraft::new("User: hi", "pm", "John", "default"))
            .await
            .unwrap();
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
        assert_eq!(repo.get_by_id(&id).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_insert_blocked_by_writer_lock_still_reports_saved() {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
        use sqlx::Connection;

        let (dir, _store, repo) = repo_with(Duration::from_millis(300)).await;

        let options = SqliteConnectOptions::new().filename(dir.path().join("sessions.db"));
        let mut writer = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut writer).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sqlx::query("COMMIT").execute(&mut writer).await.unwrap();
            writer.close().await.unwrap();
        });

        let started = std::time::Instant::now();
        let id = repo
            .save(SessionDraft::new("User: hi\nAssistant: hello", "pm", "John", "default"))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        release.await.unwrap();

        // Exactly one stored copy, under the returned id
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.get_by_id(&id).await.unwrap().id, id);
    }

    /// Inserts never complete; everything else delegates.
    struct StalledInsertStore {
        inner: Arc<dyn CollectionStore>,
    }

    #[async_trait]
    impl CollectionStore for StalledInsertStore {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        async fn insert(&self, _record: Record) -> RecallResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn get(&self, id: &str) -> RecallResult<Record> {
            self.inner.get(id).await
        }
        async fn delete(&self, id: &str) -> RecallResult<bool> {
            self.inner.delete(id).await
        }
        async fn search(
            &self,
            query: &[f32],
            filter: &MetadataFilter,
            k: usize,
        ) -> RecallResult<Vec<Hit>> {
            self.inner.search(query, filter, k).await
        }
        async fn scan(&self, filter: &MetadataFilter, limit: usize) -> RecallResult<Vec<Record>> {
            self.inner.scan(filter, limit).await
        }
        async fn count(&self) -> RecallResult<u64> {
            self.inner.count().await
        }
        async fn health(&self) -> RecallResult<String> {
            self.inner.health().await
        }
    }

    #[tokio::test]
    async fn test_insert_that_never_lands_times_out() {
        let (_dir, inner, _) = repo_with(DEFAULT_TIMEOUT).await;
        let repo = SessionRepository::new(
            Arc::new(StalledInsertStore { inner }),
            Arc::new(HashEmbeddingClient::new(DIMS).unwrap()),
            Duration::from_millis(50),
        )
        .unwrap()
        .with_insert_settle(Duration::from_millis(50));

        let err = repo
            .save(SessionDraft::new("User: hi", "pm", "John", "default"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("insert session timed out after 50ms"));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_rejects_agent_names_unfit_for_ids() {
        let (_dir, repo) = repo().await;
        for agent in ["qa/lead", "a?b", "x#y", "100%", "tech writer"] {
            let err = repo
                .save(SessionDraft::new("User: hi", agent, "Quinn", "default"))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{agent}");
        }
        assert_eq!(repo.count().await.unwrap(), 0);

        let id = repo
            .save(SessionDraft::new("User: hi", "tech-writer_2.0", "Paige", "default"))
            .await
            .unwrap();
        assert!(id.contains("-tech-writer_2.0-"));
    }
}
