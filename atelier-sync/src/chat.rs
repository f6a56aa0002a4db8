//! Optimistic chat pipeline with server reconciliation.
//!
//! A send appends a locally-visible placeholder before the round trip
//! completes, then deterministically replaces or removes it once the server
//! responds:
//!
//! ```text
//! send_message()
//!       │  append PendingMessage (local id)
//!       ▼
//! ChatBackend::send_message()          (HTTP collaborator, injected)
//!       │
//!   ┌───┴────────────────┐
//!   ▼ success            ▼ failure
//! remove placeholder   remove placeholder
//! append confirmed     set error field
//! user + assistant     append system message
//! fold usage stats     (reason embedded)
//! ```
//!
//! The placeholder is removed and its resolution appended inside one lock
//! acquisition, so the sequence never shows a placeholder alongside its
//! resolution. One send may be in flight per pipeline; overlapping calls
//! are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{ChatMessage, MessageKind};

/// Default cap on the retained message sequence.
pub const DEFAULT_RETENTION: usize = 1024;

/// Errors from the external request collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatSendError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,
}

/// Options for one send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Attach `context` to the request. When unset, `context` is ignored.
    pub include_context: bool,
    /// Opaque context payload forwarded to the backend.
    pub context: Option<serde_json::Value>,
    /// Thread the confirmed messages should belong to.
    pub thread_id: Option<String>,
}

/// Request handed to the external collaborator.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub project_id: String,
    pub content: String,
    pub context: Option<serde_json::Value>,
    pub thread_id: Option<String>,
}

/// Token/cost accounting attached to a confirmed response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageDelta {
    pub tokens: u64,
    pub cost: f64,
}

/// Server-confirmed outcome of one send.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The confirmed user message, with server-assigned id and timestamp.
    pub message: ChatMessage,
    /// The assistant reply, when the send addressed the AI.
    pub reply: Option<ChatMessage>,
    pub usage: Option<UsageDelta>,
}

/// The external request/response collaborator the pipeline calls into.
///
/// Production wires this to the HTTP layer; tests inject fakes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ChatSendError>;
}

/// Usage accounting for one month.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MonthlyUsage {
    pub messages: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Cumulative usage accounting.
///
/// Monotonically non-decreasing, updated only together with acceptance of a
/// confirmed response. The single exception is a full
/// [`ChatPipeline::clear_messages`], which resets everything to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub total_messages: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Partitioned by `YYYY-MM`.
    pub monthly: HashMap<String, MonthlyUsage>,
}

impl UsageStats {
    fn record(&mut self, confirmed: u64, usage: Option<UsageDelta>) {
        self.total_messages += confirmed;
        let month = self.monthly.entry(Utc::now().format("%Y-%m").to_string()).or_default();
        month.messages += confirmed;
        if let Some(delta) = usage {
            self.total_tokens += delta.tokens;
            self.total_cost += delta.cost;
            month.tokens += delta.tokens;
            month.cost += delta.cost;
        }
    }
}

struct ChatState {
    messages: Vec<ChatMessage>,
    pending_id: Option<String>,
    error: Option<String>,
    stats: UsageStats,
}

impl ChatState {
    fn remove_pending(&mut self, id: &str) {
        // Exact id match, not content match: locally generated ids are
        // unique, so a coincidentally identical concurrent message survives.
        self.messages.retain(|m| m.id != id);
        self.pending_id = None;
    }

    fn evict_to(&mut self, retention: usize) {
        while self.messages.len() > retention {
            let victim = self
                .messages
                .iter()
                .position(|m| Some(&m.id) != self.pending_id.as_ref());
            match victim {
                Some(i) => {
                    let evicted = self.messages.remove(i);
                    log::debug!("retention cap reached, evicting message {}", evicted.id);
                }
                None => break,
            }
        }
    }
}

/// Optimistic send pipeline for chat and AI messages.
pub struct ChatPipeline {
    backend: Arc<dyn ChatBackend>,
    state: Mutex<ChatState>,
    sending: AtomicBool,
    retention: usize,
}

impl ChatPipeline {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_retention(backend, DEFAULT_RETENTION)
    }

    /// Create with a custom retention cap (for testing).
    pub fn with_retention(backend: Arc<dyn ChatBackend>, retention: usize) -> Self {
        Self {
            backend,
            state: Mutex::new(ChatState {
                messages: Vec::new(),
                pending_id: None,
                error: None,
                stats: UsageStats::default(),
            }),
            sending: AtomicBool::new(false),
            retention,
        }
    }

    /// Send a message, showing it optimistically until the server responds.
    ///
    /// A call while another send is in flight is a no-op. Failures are
    /// absorbed: the placeholder is removed, [`Self::error`] is set, and a
    /// `system` message embedding the reason is appended so the failure is
    /// visible in the same sequence the user is reading.
    pub async fn send_message(&self, project_id: &str, content: &str, options: SendOptions) {
        if self.sending.swap(true, Ordering::AcqRel) {
            log::debug!("send already in flight, ignoring");
            return;
        }

        let pending_id = format!("local-{}", Uuid::new_v4());
        {
            let mut state = self.state.lock().await;
            state.error = None;
            state.pending_id = Some(pending_id.clone());
            state.messages.push(ChatMessage {
                id: pending_id.clone(),
                kind: MessageKind::User,
                author: "me".into(),
                content: content.to_string(),
                timestamp: Utc::now(),
                thread_id: options.thread_id.clone(),
            });
            state.evict_to(self.retention);
        }

        let request = ChatRequest {
            project_id: project_id.to_string(),
            content: content.to_string(),
            context: if options.include_context {
                options.context.clone()
            } else {
                None
            },
            thread_id: options.thread_id.clone(),
        };

        let result = self.backend.send_message(request).await;

        {
            let mut state = self.state.lock().await;
            state.remove_pending(&pending_id);

            match result {
                Ok(response) => {
                    let mut confirmed = 1u64;
                    state.messages.push(response.message);
                    if let Some(reply) = response.reply {
                        state.messages.push(reply);
                        confirmed += 1;
                    }
                    state.stats.record(confirmed, response.usage);
                }
                Err(e) => {
                    log::warn!("message send failed: {e}");
                    state.error = Some(e.to_string());
                    state.messages.push(ChatMessage {
                        id: format!("local-{}", Uuid::new_v4()),
                        kind: MessageKind::System,
                        author: "system".into(),
                        content: format!("Failed to send message: {e}"),
                        timestamp: Utc::now(),
                        thread_id: options.thread_id,
                    });
                }
            }
            state.evict_to(self.retention);
        }

        self.sending.store(false, Ordering::Release);
    }

    /// Clear messages.
    ///
    /// With a `thread_id`, removes only messages of that thread and leaves
    /// stats untouched. Without one, clears the full sequence and resets
    /// stats to zero.
    pub async fn clear_messages(&self, thread_id: Option<&str>) {
        let mut state = self.state.lock().await;
        match thread_id {
            Some(thread) => {
                state.messages.retain(|m| m.thread_id.as_deref() != Some(thread));
            }
            None => {
                state.messages.clear();
                state.pending_id = None;
                state.stats = UsageStats::default();
            }
        }
    }

    /// Snapshot of the ordered message sequence.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages.clone()
    }

    /// The last send failure, cleared at the start of the next send.
    pub async fn error(&self) -> Option<String> {
        self.state.lock().await.error.clone()
    }

    /// Snapshot of the usage accounting.
    pub async fn stats(&self) -> UsageStats {
        self.state.lock().await.stats.clone()
    }

    /// Whether a send is currently in flight.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }
}
