//! Message model shared by producers and the listener
//!
//! A message row lives in the outbox table of the producing service or the
//! inbox table of the consuming service. The listener only ever mutates the
//! bookkeeping columns (attempt counters, lock lease, terminal timestamps).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which side of the pattern a listener serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Outbox,
    Inbox,
}

impl MessageKind {
    /// Label used in logs and default object names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Inbox => "inbox",
        }
    }

    /// Default table name for this side
    pub fn default_table(self) -> &'static str {
        self.as_str()
    }

    /// Default set-returning function used by the polling listener
    pub fn default_next_messages_function(self) -> &'static str {
        match self {
            Self::Outbox => "next_outbox_messages",
            Self::Inbox => "next_inbox_messages",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-message concurrency hint stored in the `concurrency` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    #[default]
    Sequential,
    Parallel,
}

impl Concurrency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }

    /// Anything other than the literal `parallel` is treated as sequential
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("parallel") => Self::Parallel,
            _ => Self::Sequential,
        }
    }
}

/// One outbox or inbox row as persisted in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct StoredMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub segment: Option<String>,
    pub concurrency: Option<String>,
    pub payload: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub started_attempts: i32,
    pub finished_attempts: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Concurrency hint, defaulting to sequential
    pub fn concurrency(&self) -> Concurrency {
        Concurrency::parse(self.concurrency.as_deref())
    }

    /// Gap between started and finished attempts; a gap of two or more means
    /// a previous run crashed between starting and finishing an attempt.
    pub fn attempt_gap(&self) -> i32 {
        self.started_attempts - self.finished_attempts
    }

    /// A terminal row is never processed again
    pub fn is_terminal(&self) -> bool {
        self.processed_at.is_some() || self.abandoned_at.is_some()
    }
}

/// A message about to be written by the producer side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub segment: Option<String>,
    pub concurrency: Concurrency,
    pub payload: Value,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            message_type: message_type.into(),
            segment: None,
            concurrency: Concurrency::Sequential,
            payload,
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
