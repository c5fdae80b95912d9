//! Shared domain types for the collaborative filesystem.
//!
//! These structs are serialized as camelCase JSON in two places: inside the
//! CRDT containers (`fileTree`, `opLog`, `activity` hold JSON-string values)
//! and inside custom control frames on the wire. Keeping one set of types for
//! both guarantees the representations never drift.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Entry kind stored in `fileTree`. Directories are not modeled; paths are
/// opaque keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
}

/// Metadata record for one file, stored under its path in `fileTree`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub kind: FileKind,
    pub last_modified_ms: i64,
    pub last_modified_by: String,
    /// Fencing token of the write that produced this record.
    pub token: i64,
    pub size_bytes: i64,
    pub is_binary: bool,
}

/// Kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Write,
    Move,
    Delete,
}

/// One append-only entry of the `opLog` container.
///
/// Failed structural operations are logged too, with `success == false` and
/// the error name in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub token: i64,
    pub kind: OpKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    pub by: String,
    pub timestamp_ms: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a participant is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Idle,
    Reading,
    Editing,
    Moving,
    Deleting,
}

/// Per-user presence record, stored under the user id in `activity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub action: ActivityAction,
    pub timestamp_ms: i64,
}

impl Activity {
    /// Fresh idle record for a user.
    pub fn idle(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            current_file: None,
            action: ActivityAction::Idle,
            timestamp_ms: now_ms(),
        }
    }
}

/// Partial activity update, merged into the existing record.
///
/// `current_file: None` leaves the existing file untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPatch {
    pub action: ActivityAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

/// Summary of one session, carried by the `joined` control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub participant_count: usize,
    pub file_count: usize,
    pub op_count: usize,
    pub created_at_ms: i64,
}

/// Precondition failure of a structural operation (move/delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpError {
    /// Source path is not present in the session.
    FileMissing,
    /// Move destination is already present.
    DestinationExists,
}

impl std::fmt::Display for FileOpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOpError::FileMissing => write!(f, "FileMissing"),
            FileOpError::DestinationExists => write!(f, "DestinationExists"),
        }
    }
}

impl std::error::Error for FileOpError {}

/// Outcome of a structural operation. Both success and failure carry the
/// fencing token under which the attempt was logged.
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub success: bool,
    pub token: i64,
    pub error: Option<FileOpError>,
}

impl OpResult {
    pub fn ok(token: i64) -> Self {
        Self {
            success: true,
            token,
            error: None,
        }
    }

    pub fn failed(token: i64, error: FileOpError) -> Self {
        Self {
            success: false,
            token,
            error: Some(error),
        }
    }
}

/// Whole-file write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the full content.
    Overwrite,
    /// Insert at the end of the existing content.
    Append,
}
