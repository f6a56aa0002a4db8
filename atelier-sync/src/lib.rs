//! # atelier-sync — Real-time synchronization core for Atelier workspaces
//!
//! Keeps a client's view of a shared project room consistent with the
//! server: one persistent WebSocket connection that survives disconnects,
//! transparently re-establishes room membership, routes typed events to
//! independent subscribers, and reconciles optimistic local sends against
//! authoritative server responses.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │   Session    │ ◄──────────────────► │    server    │
//! │ (reconnects, │                      └──────────────┘
//! │  membership) │
//! └──────┬───────┘
//!        │ dispatch / emit
//!        ▼
//! ┌──────────────┐      ┌─────────────────┐   ┌──────────────┐
//! │ EventRouter  │ ───► │ PresenceTracker │   │ ChatPipeline │──► HTTP
//! │ (per-category│      │ (remote cursors │   │ (optimistic  │    collaborator
//! │  pub/sub)    │      │  & typing)      │   │  sends)      │
//! └──────────────┘      └─────────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events ([`ClientEvent`], [`ServerEvent`])
//! - [`session`] — connection lifecycle, bounded reconnect, room membership
//! - [`router`] — typed per-category publish/subscribe
//! - [`presence`] — reducer over remote participants' presence/cursor state
//! - [`chat`] — optimistic message pipeline with usage accounting
//! - [`store`] — persisted-state records over an external key/value store
//!
//! The crate never merges concurrent file edits — file events are
//! last-write-wins — and never queues emits made while disconnected: fresh
//! state beats stale replay.

pub mod chat;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use chat::{
    ChatBackend, ChatPipeline, ChatRequest, ChatResponse, ChatSendError, MonthlyUsage,
    SendOptions, UsageDelta, UsageStats,
};
pub use presence::{CursorState, PresenceEntry, PresenceTracker, emit_cursor_move, emit_user_typing};
pub use protocol::{
    ChatMessage, ClientEvent, CursorPosition, EventCategory, FileRecord, MessageKind,
    ProtocolError, ServerEvent,
};
pub use router::{EventRouter, SubscriptionId};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};
pub use store::{
    KeyValueStore, MemoryStore, StoreError, StoredProject, StoredUser, clear_user, load_projects,
    load_user, save_projects, save_user,
};
