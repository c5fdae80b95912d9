//! CRDT workspace document: the shared state of one session replica.
//!
//! Wraps a Yrs [`Doc`] holding the four root containers:
//!
//! ```text
//! Doc
//! ├── Map   "fileTree"     path → FileMeta (JSON string)
//! ├── Map   "fileContents" path → Y.Text (base64 when binary)
//! ├── Array "opLog"        Operation (JSON string), append-only
//! └── Map   "activity"     user id → Activity (JSON string)
//! ```
//!
//! Every public mutation runs inside a single transaction so peers observe
//! one atomic change per operation: content edit, metadata upsert, and the
//! op-log append all land in the same update.
//!
//! Updates are tagged with an [`Origin`]: transactions started by
//! `apply_update` carry `"hub"` or `"restore"`, local mutations carry none.
//! The update observer maps that to an [`UpdateScope`], which is the single
//! rule that prevents re-broadcast loops.

use std::sync::atomic::{AtomicI64, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Origin, Out, ReadTxn, StateVector,
    Subscription, Text, TextPrelim, TextRef, Transact, TransactionMut, Update,
};

use crate::types::{
    now_ms, Activity, ActivityPatch, FileKind, FileMeta, FileOpError, OpKind, OpResult, Operation,
    WriteMode,
};

const FILE_TREE: &str = "fileTree";
const FILE_CONTENTS: &str = "fileContents";
const OP_LOG: &str = "opLog";
const ACTIVITY: &str = "activity";

/// Origin tag for updates applied from the hub (or any remote peer).
pub const ORIGIN_HUB: &str = "hub";
/// Origin tag for updates applied from a snapshot.
pub const ORIGIN_RESTORE: &str = "restore";

/// Where an observed update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateScope {
    /// Produced by a local mutation; must be pushed to the hub.
    Local,
    /// Applied from the network; must never be re-sent.
    Hub,
    /// Applied from a persisted snapshot.
    Restore,
}

impl UpdateScope {
    fn origin(self) -> Option<Origin> {
        match self {
            UpdateScope::Local => None,
            UpdateScope::Hub => Some(Origin::from(ORIGIN_HUB)),
            UpdateScope::Restore => Some(Origin::from(ORIGIN_RESTORE)),
        }
    }

    fn of(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == Origin::from(ORIGIN_HUB) => UpdateScope::Hub,
            Some(o) if *o == Origin::from(ORIGIN_RESTORE) => UpdateScope::Restore,
            _ => UpdateScope::Local,
        }
    }
}

/// Document-layer errors. Decode failures point at a misbehaving peer;
/// apply failures are fatal to the session that owns the document.
#[derive(Debug, Clone)]
pub enum DocError {
    InvalidUpdate(String),
    ApplyFailed(String),
    InvalidStateVector(String),
    InvalidBase64(String),
    ObserverFailed(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::InvalidUpdate(e) => write!(f, "invalid update bytes: {e}"),
            DocError::ApplyFailed(e) => write!(f, "update integration failed: {e}"),
            DocError::InvalidStateVector(e) => write!(f, "invalid state vector: {e}"),
            DocError::InvalidBase64(e) => write!(f, "binary content is not base64: {e}"),
            DocError::ObserverFailed(e) => write!(f, "update observer registration failed: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// One replica's view of a session document.
pub struct WorkspaceDoc {
    doc: Doc,
    file_tree: MapRef,
    file_contents: MapRef,
    op_log: ArrayRef,
    activity: MapRef,
    /// Fencing-token counter. In-memory only; resets with the process.
    token_counter: AtomicI64,
}

impl WorkspaceDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let file_tree = doc.get_or_insert_map(FILE_TREE);
        let file_contents = doc.get_or_insert_map(FILE_CONTENTS);
        let op_log = doc.get_or_insert_array(OP_LOG);
        let activity = doc.get_or_insert_map(ACTIVITY);
        Self {
            doc,
            file_tree,
            file_contents,
            op_log,
            activity,
            token_counter: AtomicI64::new(0),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Next fencing token: strictly increasing for the lifetime of this
    /// replica, never persisted.
    pub fn next_token(&self) -> i64 {
        self.token_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ─── File operations ──────────────────────────────────────────────

    /// Write text content. Creates the file on first write. Returns the
    /// fencing token of the logged operation.
    pub fn write_file(&self, path: &str, content: &str, by: &str, mode: WriteMode) -> i64 {
        self.write_impl(path, content, by, mode, false, None)
    }

    /// Write binary content, carried base64-encoded in the text container.
    pub fn write_file_binary(&self, path: &str, bytes: &[u8], by: &str) -> i64 {
        let encoded = BASE64.encode(bytes);
        self.write_impl(
            path,
            &encoded,
            by,
            WriteMode::Overwrite,
            true,
            Some(bytes.len() as i64),
        )
    }

    fn write_impl(
        &self,
        path: &str,
        content: &str,
        by: &str,
        mode: WriteMode,
        is_binary: bool,
        raw_size: Option<i64>,
    ) -> i64 {
        let token = self.next_token();
        let now = now_ms();
        let mut txn = self.doc.transact_mut();

        let created = !self.file_tree.contains_key(&txn, path);
        let text = match self.file_contents.get(&txn, path) {
            Some(Out::YText(t)) => t,
            _ => self
                .file_contents
                .insert(&mut txn, path, TextPrelim::new("")),
        };

        match mode {
            WriteMode::Overwrite => {
                let len = text.len(&txn);
                if len > 0 {
                    text.remove_range(&mut txn, 0, len);
                }
                text.insert(&mut txn, 0, content);
            }
            WriteMode::Append => {
                let len = text.len(&txn);
                text.insert(&mut txn, len, content);
            }
        }

        let size_bytes = raw_size.unwrap_or_else(|| text.get_string(&txn).len() as i64);
        self.put_meta(&mut txn, path, by, token, now, size_bytes, is_binary);
        self.push_op(
            &mut txn,
            Operation {
                token,
                kind: if created { OpKind::Create } else { OpKind::Write },
                path: path.to_string(),
                new_path: None,
                by: by.to_string(),
                timestamp_ms: now,
                success: true,
                error: None,
            },
        );
        token
    }

    /// Insert text at a byte offset (clamped to the current length).
    /// Fails with `FileMissing` if the file does not exist.
    pub fn insert_text(&self, path: &str, index: u32, chunk: &str, by: &str) -> OpResult {
        self.edit_text(path, by, |text, txn| {
            let len = text.len(txn);
            text.insert(txn, index.min(len), chunk);
        })
    }

    /// Delete a byte range (clamped). Fails with `FileMissing` if absent.
    pub fn delete_range(&self, path: &str, index: u32, len: u32, by: &str) -> OpResult {
        self.edit_text(path, by, |text, txn| {
            let total = text.len(txn);
            let start = index.min(total);
            let amount = len.min(total - start);
            if amount > 0 {
                text.remove_range(txn, start, amount);
            }
        })
    }

    fn edit_text<F>(&self, path: &str, by: &str, edit: F) -> OpResult
    where
        F: FnOnce(&TextRef, &mut TransactionMut),
    {
        let token = self.next_token();
        let now = now_ms();
        let mut txn = self.doc.transact_mut();

        let Some(Out::YText(text)) = self.file_contents.get(&txn, path) else {
            self.push_failed_op(&mut txn, OpKind::Write, path, None, by, token, now);
            return OpResult::failed(token, FileOpError::FileMissing);
        };

        edit(&text, &mut txn);
        let size_bytes = text.get_string(&txn).len() as i64;
        let is_binary = self
            .meta_in(&txn, path)
            .map(|m| m.is_binary)
            .unwrap_or(false);
        self.put_meta(&mut txn, path, by, token, now, size_bytes, is_binary);
        self.push_op(
            &mut txn,
            Operation {
                token,
                kind: OpKind::Write,
                path: path.to_string(),
                new_path: None,
                by: by.to_string(),
                timestamp_ms: now,
                success: true,
                error: None,
            },
        );
        OpResult::ok(token)
    }

    /// Rename `old` to `new`. Preconditions are checked against the current
    /// merged document; the outcome is logged either way.
    pub fn move_file(&self, old: &str, new: &str, by: &str) -> OpResult {
        let token = self.next_token();
        let now = now_ms();
        let mut txn = self.doc.transact_mut();

        if !self.file_tree.contains_key(&txn, old) {
            self.push_failed_op(&mut txn, OpKind::Move, old, Some(new), by, token, now);
            return OpResult::failed(token, FileOpError::FileMissing);
        }
        if self.file_tree.contains_key(&txn, new) {
            let mut op = self.failed_op(OpKind::Move, old, Some(new), by, token, now);
            op.error = Some(FileOpError::DestinationExists.to_string());
            self.push_op(&mut txn, op);
            return OpResult::failed(token, FileOpError::DestinationExists);
        }

        let content = match self.file_contents.get(&txn, old) {
            Some(Out::YText(t)) => t.get_string(&txn),
            _ => String::new(),
        };
        let old_meta = self.meta_in(&txn, old);

        self.file_contents
            .insert(&mut txn, new, TextPrelim::new(content));
        self.file_contents.remove(&mut txn, old);
        self.file_tree.remove(&mut txn, old);
        let meta = FileMeta {
            kind: FileKind::File,
            last_modified_ms: now,
            last_modified_by: by.to_string(),
            token,
            size_bytes: old_meta.as_ref().map(|m| m.size_bytes).unwrap_or(0),
            is_binary: old_meta.map(|m| m.is_binary).unwrap_or(false),
        };
        self.file_tree
            .insert(&mut txn, new, json_value(&meta));
        self.push_op(
            &mut txn,
            Operation {
                token,
                kind: OpKind::Move,
                path: old.to_string(),
                new_path: Some(new.to_string()),
                by: by.to_string(),
                timestamp_ms: now,
                success: true,
                error: None,
            },
        );
        OpResult::ok(token)
    }

    /// Delete a file. The outcome is logged either way.
    pub fn delete_file(&self, path: &str, by: &str) -> OpResult {
        let token = self.next_token();
        let now = now_ms();
        let mut txn = self.doc.transact_mut();

        if !self.file_tree.contains_key(&txn, path) {
            self.push_failed_op(&mut txn, OpKind::Delete, path, None, by, token, now);
            return OpResult::failed(token, FileOpError::FileMissing);
        }

        self.file_contents.remove(&mut txn, path);
        self.file_tree.remove(&mut txn, path);
        self.push_op(
            &mut txn,
            Operation {
                token,
                kind: OpKind::Delete,
                path: path.to_string(),
                new_path: None,
                by: by.to_string(),
                timestamp_ms: now,
                success: true,
                error: None,
            },
        );
        OpResult::ok(token)
    }

    /// Current text content, or `None` if the path is absent. Binary files
    /// come back as their base64 form; use [`read_file_bytes`] instead.
    ///
    /// [`read_file_bytes`]: WorkspaceDoc::read_file_bytes
    pub fn read_file(&self, path: &str) -> Option<String> {
        let txn = self.doc.transact();
        match self.file_contents.get(&txn, path) {
            Some(Out::YText(t)) => Some(t.get_string(&txn)),
            _ => None,
        }
    }

    /// Decoded content bytes: base64-decoded for binary files, UTF-8 bytes
    /// otherwise.
    pub fn read_file_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, DocError> {
        let txn = self.doc.transact();
        let content = match self.file_contents.get(&txn, path) {
            Some(Out::YText(t)) => t.get_string(&txn),
            _ => return Ok(None),
        };
        let is_binary = self
            .meta_in(&txn, path)
            .map(|m| m.is_binary)
            .unwrap_or(false);
        if is_binary {
            BASE64
                .decode(content.as_bytes())
                .map(Some)
                .map_err(|e| DocError::InvalidBase64(e.to_string()))
        } else {
            Ok(Some(content.into_bytes()))
        }
    }

    /// Metadata for one path.
    pub fn file_meta(&self, path: &str) -> Option<FileMeta> {
        let txn = self.doc.transact();
        self.meta_in(&txn, path)
    }

    /// All files whose path starts with `prefix` (all files when `None`),
    /// sorted by path.
    pub fn list_files(&self, prefix: Option<&str>) -> Vec<(String, FileMeta)> {
        let txn = self.doc.transact();
        let mut files: Vec<(String, FileMeta)> = self
            .file_tree
            .iter(&txn)
            .filter_map(|(path, value)| {
                let meta = parse_json::<FileMeta>(&value)?;
                match prefix {
                    Some(p) if !path.starts_with(p) => None,
                    _ => Some((path.to_string(), meta)),
                }
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files
    }

    pub fn file_count(&self) -> usize {
        let txn = self.doc.transact();
        self.file_tree.len(&txn) as usize
    }

    /// The full op log, oldest first. Unparseable entries are skipped.
    pub fn operations(&self) -> Vec<Operation> {
        let txn = self.doc.transact();
        self.op_log
            .iter(&txn)
            .filter_map(|value| parse_json::<Operation>(&value))
            .collect()
    }

    pub fn op_count(&self) -> usize {
        let txn = self.doc.transact();
        self.op_log.len(&txn) as usize
    }

    // ─── Activity ─────────────────────────────────────────────────────

    /// Merge a patch into a user's activity record and stamp it with the
    /// current time. Returns the merged record.
    pub fn update_activity(&self, user_id: &str, patch: &ActivityPatch) -> Activity {
        let mut txn = self.doc.transact_mut();
        let previous = match self.activity.get(&txn, user_id) {
            Some(value) => parse_json::<Activity>(&value),
            None => None,
        };
        let merged = Activity {
            user_id: user_id.to_string(),
            current_file: patch
                .current_file
                .clone()
                .or(previous.and_then(|p| p.current_file)),
            action: patch.action,
            timestamp_ms: now_ms(),
        };
        self.activity
            .insert(&mut txn, user_id, json_value(&merged));
        merged
    }

    /// Drop a user's activity record (on participant departure).
    pub fn remove_activity(&self, user_id: &str) {
        let mut txn = self.doc.transact_mut();
        self.activity.remove(&mut txn, user_id);
    }

    pub fn activity_of(&self, user_id: &str) -> Option<Activity> {
        let txn = self.doc.transact();
        self.activity
            .get(&txn, user_id)
            .and_then(|v| parse_json::<Activity>(&v))
    }

    pub fn activities(&self) -> Vec<Activity> {
        let txn = self.doc.transact();
        self.activity
            .iter(&txn)
            .filter_map(|(_, value)| parse_json::<Activity>(&value))
            .collect()
    }

    // ─── Sync surface ─────────────────────────────────────────────────

    /// Compact summary of everything this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// The updates a peer with `remote_sv` is missing.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| DocError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Full document state as one update; this is the snapshot format.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate an update, tagging the transaction with the scope's origin
    /// so observers can tell network updates from local ones.
    pub fn apply_update(&self, bytes: &[u8], scope: UpdateScope) -> Result<(), DocError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
        let mut txn = match scope.origin() {
            Some(origin) => self.doc.transact_mut_with(origin),
            None => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|e| DocError::ApplyFailed(e.to_string()))
    }

    /// Subscribe to committed updates. The callback receives the update
    /// bytes and the scope derived from the transaction origin. Dropping the
    /// returned subscription unsubscribes.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription, DocError>
    where
        F: Fn(Vec<u8>, UpdateScope) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                callback(event.update.clone(), UpdateScope::of(txn.origin()));
            })
            .map_err(|e| DocError::ObserverFailed(e.to_string()))
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn meta_in<T: ReadTxn>(&self, txn: &T, path: &str) -> Option<FileMeta> {
        self.file_tree
            .get(txn, path)
            .and_then(|v| parse_json::<FileMeta>(&v))
    }

    fn put_meta(
        &self,
        txn: &mut TransactionMut,
        path: &str,
        by: &str,
        token: i64,
        now: i64,
        size_bytes: i64,
        is_binary: bool,
    ) {
        let meta = FileMeta {
            kind: FileKind::File,
            last_modified_ms: now,
            last_modified_by: by.to_string(),
            token,
            size_bytes,
            is_binary,
        };
        self.file_tree.insert(txn, path, json_value(&meta));
    }

    fn push_op(&self, txn: &mut TransactionMut, op: Operation) {
        self.op_log.push_back(txn, json_value(&op));
    }

    fn failed_op(
        &self,
        kind: OpKind,
        path: &str,
        new_path: Option<&str>,
        by: &str,
        token: i64,
        now: i64,
    ) -> Operation {
        Operation {
            token,
            kind,
            path: path.to_string(),
            new_path: new_path.map(str::to_string),
            by: by.to_string(),
            timestamp_ms: now,
            success: false,
            error: Some(FileOpError::FileMissing.to_string()),
        }
    }

    fn push_failed_op(
        &self,
        txn: &mut TransactionMut,
        kind: OpKind,
        path: &str,
        new_path: Option<&str>,
        by: &str,
        token: i64,
        now: i64,
    ) {
        let op = self.failed_op(kind, path, new_path, by, token, now);
        self.push_op(txn, op);
    }
}

impl Default for WorkspaceDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn json_value<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &Out) -> Option<T> {
    match value {
        Out::Any(Any::String(s)) => serde_json::from_str(s).ok(),
        _ => None,
    }
}
