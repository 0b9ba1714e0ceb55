use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, RecallResult};
use crate::store::{Metadata, MetadataValue};

/// Status written for every saved session.
pub const STATUS_COMPLETED: &str = "completed";

/// Metadata keys as they appear in the store.
pub mod keys {
    pub const AGENT_NAME: &str = "agent_name";
    pub const AGENT_PERSONA: &str = "agent_persona";
    pub const WORKFLOW: &str = "workflow";
    pub const PROJECT_NAME: &str = "project_name";
    pub const START_TIME: &str = "start_time";
    pub const END_TIME: &str = "end_time";
    pub const MESSAGE_COUNT: &str = "message_count";
    pub const TOPICS: &str = "topics";
    pub const ARTIFACTS_CREATED: &str = "artifacts_created";
    pub const SESSION_STATUS: &str = "session_status";
}

/// Typed session metadata. Flattened to primitive values only at the store
/// boundary (see [`SessionMetadata::to_metadata`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub agent_name: String,
    pub agent_persona: String,
    pub workflow: String,
    pub project_name: String,
    #[serde(with = "timestamp")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub end_time: DateTime<Utc>,
    pub message_count: u32,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub artifacts_created: Vec<String>,
    pub session_status: String,
}

impl SessionMetadata {
    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert(keys::AGENT_NAME.into(), self.agent_name.clone().into());
        m.insert(keys::AGENT_PERSONA.into(), self.agent_persona.clone().into());
        m.insert(keys::WORKFLOW.into(), self.workflow.clone().into());
        m.insert(keys::PROJECT_NAME.into(), self.project_name.clone().into());
        m.insert(keys::START_TIME.into(), format_timestamp(&self.start_time).into());
        m.insert(keys::END_TIME.into(), format_timestamp(&self.end_time).into());
        m.insert(
            keys::MESSAGE_COUNT.into(),
            MetadataValue::Int(i64::from(self.message_count)),
        );
        m.insert(keys::TOPICS.into(), encode_list(&self.topics).into());
        m.insert(
            keys::ARTIFACTS_CREATED.into(),
            encode_list(&self.artifacts_created).into(),
        );
        m.insert(keys::SESSION_STATUS.into(), self.session_status.clone().into());
        m
    }

    /// Decode stored metadata. `CorruptRecord` when a required field is
    /// missing or has the wrong type.
    pub fn from_metadata(id: &str, m: &Metadata) -> RecallResult<Self> {
        let corrupt = |reason: String| RecallError::CorruptRecord {
            id: id.to_string(),
            reason,
        };
        let text = |key: &str| -> RecallResult<String> {
            m.get(key)
                .and_then(MetadataValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| corrupt(format!("missing or non-string field {key:?}")))
        };
        let time = |key: &str| -> RecallResult<DateTime<Utc>> {
            let raw = text(key)?;
            parse_timestamp(&raw).ok_or_else(|| corrupt(format!("unparseable {key} {raw:?}")))
        };

        let message_count = match m.get(keys::MESSAGE_COUNT) {
            Some(MetadataValue::Int(n)) => u32::try_from(*n)
                .map_err(|_| corrupt(format!("message_count {n} out of range")))?,
            _ => return Err(corrupt("missing or non-integer field \"message_count\"".into())),
        };

        Ok(Self {
            agent_name: text(keys::AGENT_NAME)?,
            agent_persona: text(keys::AGENT_PERSONA)?,
            workflow: text(keys::WORKFLOW)?,
            project_name: text(keys::PROJECT_NAME)?,
            start_time: time(keys::START_TIME)?,
            end_time: time(keys::END_TIME)?,
            message_count,
            topics: m
                .get(keys::TOPICS)
                .and_then(MetadataValue::as_str)
                .map(decode_list)
                .unwrap_or_default(),
            artifacts_created: m
                .get(keys::ARTIFACTS_CREATED)
                .and_then(MetadataValue::as_str)
                .map(decode_list)
                .unwrap_or_default(),
            session_status: m
                .get(keys::SESSION_STATUS)
                .and_then(MetadataValue::as_str)
                .unwrap_or(STATUS_COMPLETED)
                .to_string(),
        })
    }
}

/// A stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub document: String,
    pub metadata: SessionMetadata,
}

/// Metadata-only projection returned by listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub metadata: SessionMetadata,
}

/// One ranked retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub session_id: String,
    pub document: String,
    pub metadata: SessionMetadata,
    /// Cosine distance in `[0, 2]`.
    pub distance: f32,
    /// `1 - distance`, i.e. cosine similarity in `[-1, 1]`.
    pub relevance_score: f32,
}

/// Comma-joined list encoding. Commas inside elements do not survive a
/// round trip.
pub fn encode_list(items: &[String]) -> String {
    items.join(",")
}

/// Inverse of [`encode_list`]: splits on commas, trims, drops empties.
pub fn decode_list(encoded: &str) -> Vec<String> {
    encoded
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Occurrences of `"User:"` plus occurrences of `"Assistant:"`.
pub fn count_messages(document: &str) -> u32 {
    let n = document.matches("User:").count() + document.matches("Assistant:").count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Current time at the precision sessions are stored with.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// `2025-01-15T14:30:00.000000Z`
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Serde adapter keeping the stored timestamp format on the wire.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid RFC 3339 timestamp {raw:?}")))
    }
}
