use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RecallError};
use crate::repository::{SessionDraft, SessionFilter, SessionQuery};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecallRequest {
    Ping,
    Health,
    Save {
        #[serde(flatten)]
        draft: SessionDraft,
    },
    Query {
        #[serde(flatten)]
        query: SessionQuery,
    },
    Context {
        #[serde(flatten)]
        query: SessionQuery,
        #[serde(default)]
        max_chars: Option<usize>,
    },
    List {
        #[serde(flatten)]
        filter: SessionFilter,
        #[serde(default)]
        limit: Option<usize>,
    },
    Get {
        id: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecallResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    pub version: String,
}

impl RecallResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            error_kind: None,
            version: VERSION.to_string(),
        }
    }

    pub fn err(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            error_kind: Some(kind),
            version: VERSION.to_string(),
        }
    }

    pub fn from_error(e: &RecallError) -> Self {
        Self::err(e.kind(), e.to_string())
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
