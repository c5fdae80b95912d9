//! # collabfs — real-time collaborative filesystem
//!
//! Multiple clients share one logical document per session: a set of files,
//! their metadata, an append-only operation log, and per-user activity. The
//! document is a CRDT (Yrs), so concurrent character-level edits merge
//! deterministically without locks and without data loss. A central hub
//! relays incremental updates between peers and periodically snapshots each
//! session so it survives restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │  Replica    │ ◄─────────────────► │     Hub     │
//! │ (per user)  │   framed protocol   │  (central)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ WorkspaceDoc│                     │ Session     │
//! │ (local)     │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                ┌───────────┼───────────┐
//!                                ▼           ▼           ▼
//!                         SessionChannel  SnapshotStore  peers
//! ```
//!
//! ## Modules
//!
//! - [`types`] — shared domain types (file metadata, op log, activity)
//! - [`protocol`] — varuint-framed wire codec with a JSON control channel
//! - [`document`] — the CRDT workspace document and its file operations
//! - [`session`] — server-side session state (participants, fencing tokens)
//! - [`broadcast`] — per-session frame fan-out with backpressure
//! - [`snapshot`] — one-file-per-session persistence
//! - [`hub`] — the coordination hub (relay, lifecycle, shutdown)
//! - [`client`] — client replica with reconnect and heartbeat

pub mod broadcast;
pub mod client;
pub mod document;
pub mod hub;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod types;

pub use broadcast::{ChannelStats, SessionChannel, SessionFrame, HUB_SENDER};
pub use client::{
    ClientError, ConnectionState, Replica, ReplicaConfig, ReplicaEvent,
};
pub use document::{DocError, UpdateScope, WorkspaceDoc, ORIGIN_HUB, ORIGIN_RESTORE};
pub use hub::{Hub, HubConfig, HubError, HubStats};
pub use protocol::{ControlMessage, Frame, ProtocolError, SyncFrame};
pub use session::Session;
pub use snapshot::{SnapshotError, SnapshotStore};
pub use types::{
    Activity, ActivityAction, ActivityPatch, FileKind, FileMeta, FileOpError, OpKind,
    OpResult, Operation, SessionStats, WriteMode,
};
