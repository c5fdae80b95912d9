//! Server-side session state: one shared document plus its participants.
//!
//! A session is created lazily on the first join for its id and destroyed
//! once the participant set empties and a final snapshot has been written
//! (the hub owns that lifecycle). All mutations go through the hub's
//! per-session lock, which makes the check-then-mutate of structural
//! operations atomic and gives fencing tokens their total order.

use std::collections::HashSet;

use crate::document::{DocError, UpdateScope, WorkspaceDoc};
use crate::types::{
    now_ms, Activity, ActivityPatch, OpResult, SessionStats, WriteMode,
};

pub struct Session {
    session_id: String,
    created_at_ms: i64,
    participants: HashSet<String>,
    doc: WorkspaceDoc,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at_ms: now_ms(),
            participants: HashSet::new(),
            doc: WorkspaceDoc::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn doc(&self) -> &WorkspaceDoc {
        &self.doc
    }

    // ─── Participants ─────────────────────────────────────────────────

    /// Returns `true` if the user was not yet a participant.
    pub fn add_participant(&mut self, user_id: &str) -> bool {
        self.participants.insert(user_id.to_string())
    }

    /// Removes the user and their activity record. Returns `true` if the
    /// user was a participant.
    pub fn remove_participant(&mut self, user_id: &str) -> bool {
        let removed = self.participants.remove(user_id);
        if removed {
            self.doc.remove_activity(user_id);
        }
        removed
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participants(&self) -> Vec<String> {
        let mut users: Vec<String> = self.participants.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            participant_count: self.participants.len(),
            file_count: self.doc.file_count(),
            op_count: self.doc.op_count(),
            created_at_ms: self.created_at_ms,
        }
    }

    // ─── File operations (single-writer via the hub's session lock) ───

    pub fn write_file(&self, path: &str, content: &str, by: &str, mode: WriteMode) -> i64 {
        self.doc.write_file(path, content, by, mode)
    }

    pub fn move_file(&self, old: &str, new: &str, by: &str) -> OpResult {
        self.doc.move_file(old, new, by)
    }

    pub fn delete_file(&self, path: &str, by: &str) -> OpResult {
        self.doc.delete_file(path, by)
    }

    pub fn update_activity(&self, user_id: &str, patch: &ActivityPatch) -> Activity {
        self.doc.update_activity(user_id, patch)
    }

    // ─── Persistence ──────────────────────────────────────────────────

    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.doc.snapshot_bytes()
    }

    /// Apply persisted snapshot bytes. A failure leaves the session usable
    /// and empty: the caller treats the snapshot as absent.
    pub fn restore_from(&self, bytes: &[u8]) -> Result<(), DocError> {
        self.doc.apply_update(bytes, UpdateScope::Restore)
    }
}
