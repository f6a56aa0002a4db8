//! Presence & cursor tracking for remote participants.
//!
//! The tracker is a pure reducer over inbound events — it mirrors what the
//! server has told us about other participants and holds no independent
//! source of truth:
//!
//! ```text
//! user:joined  ──► insert/overwrite entry
//! user:left    ──► remove entry
//! user:typing  ──► update is_typing on an existing entry, else drop
//! cursor:move  ──► update cursor on an existing entry, else drop
//! ```
//!
//! Updates for a user whose join has not been observed are dropped rather
//! than creating a partial entry. The local user is never tracked here; the
//! [`emit_user_typing`]/[`emit_cursor_move`] helpers publish the local
//! state through the router without touching the map.

use std::collections::HashMap;

use crate::protocol::{ClientEvent, CursorPosition, ServerEvent};
use crate::router::EventRouter;

/// Upper bound on tracked participants. Joins beyond this are dropped.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 128;

/// A remote participant's cursor location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub file_id: String,
    pub line: u32,
    pub column: u32,
}

/// Observed state of one remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub is_typing: bool,
    pub cursor: Option<CursorState>,
}

impl PresenceEntry {
    fn new(user_id: String, username: String, avatar: Option<String>) -> Self {
        Self {
            user_id,
            username,
            avatar,
            is_typing: false,
            cursor: None,
        }
    }
}

/// Tracks all remote participants in the current room.
pub struct PresenceTracker {
    entries: HashMap<String, PresenceEntry>,
    max_participants: usize,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PARTICIPANTS)
    }

    /// Create with a custom participant cap (for testing).
    pub fn with_limit(max_participants: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_participants,
        }
    }

    /// Fold one inbound event into the map.
    ///
    /// Non-presence events are ignored, so the tracker can be fed from a
    /// combined presence + cursor subscription without filtering.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::UserJoined { id, username, avatar } => {
                if !self.entries.contains_key(id) && self.entries.len() >= self.max_participants {
                    log::warn!(
                        "presence map full ({} participants), dropping join for {id}",
                        self.max_participants
                    );
                    return;
                }
                log::debug!("participant {username} ({id}) joined");
                self.entries.insert(
                    id.clone(),
                    PresenceEntry::new(id.clone(), username.clone(), avatar.clone()),
                );
            }

            ServerEvent::UserLeft { user_id } => {
                if self.entries.remove(user_id).is_some() {
                    log::debug!("participant {user_id} left");
                }
            }

            ServerEvent::UserTyping { user_id, is_typing, .. } => {
                match self.entries.get_mut(user_id) {
                    Some(entry) => entry.is_typing = *is_typing,
                    None => log::trace!("typing update for unknown user {user_id}, dropped"),
                }
            }

            ServerEvent::CursorMove {
                file_id,
                position,
                user_id,
                ..
            } => match self.entries.get_mut(user_id) {
                Some(entry) => {
                    entry.cursor = Some(CursorState {
                        file_id: file_id.clone(),
                        line: position.line,
                        column: position.column,
                    });
                }
                None => log::trace!("cursor update for unknown user {user_id}, dropped"),
            },

            _ => {}
        }
    }

    /// Look up one participant.
    pub fn participant(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// All tracked participants, in no particular order.
    pub fn participants(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn participant_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everyone. Called when leaving a room; the server re-announces
    /// participants after the next join.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish the local user's typing state. No local mutation; silently
/// dropped while disconnected.
pub async fn emit_user_typing(
    router: &EventRouter,
    project_id: &str,
    file_id: Option<String>,
    is_typing: bool,
) -> bool {
    router
        .emit(ClientEvent::UserTyping {
            project_id: project_id.to_string(),
            file_id,
            is_typing,
        })
        .await
}

/// Publish the local user's cursor position. No local mutation; silently
/// dropped while disconnected.
pub async fn emit_cursor_move(
    router: &EventRouter,
    project_id: &str,
    file_id: &str,
    position: CursorPosition,
) -> bool {
    router
        .emit(ClientEvent::CursorMove {
            project_id: project_id.to_string(),
            file_id: file_id.to_string(),
            position,
        })
        .await
}
