//! Typed per-category event routing.
//!
//! The router is the only path between the synchronization components and
//! the transport:
//!
//! ```text
//! wire ──► Session reader ──► dispatch() ──► per-category subscriber queues
//! components ──► emit() ──► bound outgoing channel ──► Session writer ──► wire
//! ```
//!
//! Subscriptions are channel-based: [`EventRouter::subscribe`] hands back a
//! receiver, and `dispatch` delivers to every live subscriber of the event's
//! category in registration order. A subscriber that has gone away (receiver
//! dropped) never blocks delivery to the rest. Emitting while no transport
//! is bound is silently dropped, never queued — the core favors fresh state
//! over stale replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ClientEvent, EventCategory, ServerEvent};

/// Handle identifying one subscription, for targeted unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Publish/subscribe surface for inbound events plus the single funnel for
/// outbound emission.
pub struct EventRouter {
    subscribers: RwLock<HashMap<EventCategory, Vec<Subscriber>>>,
    outgoing: RwLock<Option<mpsc::UnboundedSender<ClientEvent>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            outgoing: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for one category.
    ///
    /// Events of that category are delivered to the returned receiver in
    /// wire-arrival order. Dropping the receiver ends the subscription; the
    /// router prunes it on the next dispatch.
    pub async fn subscribe(
        &self,
        category: EventCategory,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subs = self.subscribers.write().await;
        subs.entry(category)
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove one subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, category: EventCategory, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().await;
        match subs.get_mut(&category) {
            Some(list) => {
                let before = list.len();
                list.retain(|s| s.id != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Remove every subscription for a category.
    pub async fn clear(&self, category: EventCategory) {
        let mut subs = self.subscribers.write().await;
        subs.remove(&category);
    }

    /// Number of live subscribers for a category.
    pub async fn subscriber_count(&self, category: EventCategory) -> usize {
        let subs = self.subscribers.read().await;
        subs.get(&category).map_or(0, |l| l.len())
    }

    /// Send an event toward the server.
    ///
    /// Returns `true` if the event was handed to the transport. When no
    /// transport is bound (disconnected) the event is dropped.
    pub async fn emit(&self, event: ClientEvent) -> bool {
        let outgoing = self.outgoing.read().await;
        match outgoing.as_ref() {
            Some(tx) if tx.send(event).is_ok() => true,
            Some(_) => {
                log::debug!("outgoing channel closed, event dropped");
                false
            }
            None => {
                log::debug!("emit while disconnected, event dropped");
                false
            }
        }
    }

    /// Whether a transport is currently bound.
    pub async fn is_bound(&self) -> bool {
        self.outgoing.read().await.is_some()
    }

    /// Wire the outgoing funnel to a live connection's writer.
    pub(crate) async fn bind(&self, tx: mpsc::UnboundedSender<ClientEvent>) {
        *self.outgoing.write().await = Some(tx);
    }

    /// Detach the outgoing funnel; subsequent emits are dropped.
    pub(crate) async fn unbind(&self) {
        *self.outgoing.write().await = None;
    }

    /// Deliver an inbound event to every subscriber of its category.
    ///
    /// The session invokes this for every wire event it reads. Events
    /// without a category (`auth_error`) are ignored here; the session
    /// consumes them before dispatch.
    pub async fn dispatch(&self, event: ServerEvent) {
        let Some(category) = event.category() else {
            return;
        };

        let mut subs = self.subscribers.write().await;
        let Some(list) = subs.get_mut(&category) else {
            log::trace!("no subscribers for {category}, event dropped");
            return;
        };

        // Deliver in registration order, pruning dead receivers as we go.
        list.retain(|s| s.tx.send(event.clone()).is_ok());
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
