//! Core data types shared by the controller, the backend adapter and the
//! HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One committed line of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Parameters handed to the ingestion service alongside the file paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexConfig {
    pub index_name: String,
}

/// Opaque reference to an ingested document's index.
///
/// Returned by [`ChatBackend::ingest`](crate::backend::ChatBackend::ingest)
/// and required by every message exchange. Two handles are the same
/// conversation only if their `index_name`s are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationHandle {
    pub index_name: String,
    /// Name of the uploaded file as the user supplied it.
    pub document_name: String,
    /// Hex SHA-256 of the uploaded bytes.
    pub document_sha256: String,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Assistant output from one conversational call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
}

/// A chunk of extracted document text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}
