//! Cross-context read-state propagation.
//!
//! Every read receipt one context sends is announced to its siblings twice:
//! on an in-process bus and through a write to the shared store, which
//! produces a storage-change event for every other context. Receivers apply
//! each envelope once, whichever path delivers it first.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::KeyValueStore;
use crate::lock;

pub const READ_BROADCAST_KEY: &str = "livechat:read-broadcast";
pub const SEEN_CAPACITY: usize = 5000;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadEnvelope {
    pub id: String,
    /// Unix millis.
    pub at: i64,
    pub conversation_id: String,
    pub last_read_msg_id: String,
}

impl ReadEnvelope {
    pub fn new(conversation_id: impl Into<String>, last_read_msg_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            at: Utc::now().timestamp_millis(),
            conversation_id: conversation_id.into(),
            last_read_msg_id: last_read_msg_id.into(),
        }
    }
}

// ── Dedup ────────────────────────────────────────────────────────────────────

/// Bounded set of envelope ids; the oldest id is evicted first.
#[derive(Debug)]
pub struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity: capacity.max(1) }
    }

    /// Returns `false` if `id` was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Shared hub ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BusPacket {
    pub origin: Uuid,
    pub envelope: ReadEnvelope,
}

/// Notification that another context wrote a key.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub origin: Uuid,
    pub key: String,
    pub new_value: Option<String>,
}

/// What contexts living in one process share: a message bus, a storage-change
/// feed and the durable store itself.
#[derive(Clone)]
pub struct SharedContexts {
    bus: broadcast::Sender<BusPacket>,
    storage: broadcast::Sender<StorageEvent>,
    store: Arc<dyn KeyValueStore>,
}

impl SharedContexts {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (storage, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { bus, storage, store }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

pub struct BroadcastCoordinator {
    context_id: Uuid,
    shared: SharedContexts,
    seen: Arc<Mutex<SeenSet>>,
}

impl BroadcastCoordinator {
    pub fn new(shared: SharedContexts) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            shared,
            seen: Arc::new(Mutex::new(SeenSet::new(SEEN_CAPACITY))),
        }
    }

    /// Announces a sent read receipt to every sibling context.
    pub async fn publish(&self, conversation_id: &str, last_read_msg_id: &str) -> ReadEnvelope {
        let envelope = ReadEnvelope::new(conversation_id, last_read_msg_id);
        lock(&self.seen).insert(&envelope.id);

        // No subscribers is fine: there may be no siblings.
        let _ = self.shared.bus.send(BusPacket { origin: self.context_id, envelope: envelope.clone() });

        match serde_json::to_string(&envelope) {
            Ok(raw) => {
                if let Err(e) = self.shared.store.set(READ_BROADCAST_KEY, &raw).await {
                    warn!("Failed to persist read broadcast: {e}");
                }
                let _ = self.shared.storage.send(StorageEvent {
                    origin: self.context_id,
                    key: READ_BROADCAST_KEY.to_string(),
                    new_value: Some(raw),
                });
            }
            Err(e) => warn!("Failed to encode read broadcast: {e}"),
        }
        envelope
    }

    /// Delivers every sibling envelope to `apply`, once per envelope id.
    ///
    /// Subscribes before returning, so nothing published afterwards is missed.
    pub fn listen<F>(&self, apply: F) -> JoinHandle<()>
    where
        F: Fn(ReadEnvelope) + Send + Sync + 'static,
    {
        let mut bus = self.shared.bus.subscribe();
        let mut storage = self.shared.storage.subscribe();
        let context_id = self.context_id;
        let seen = Arc::clone(&self.seen);

        tokio::spawn(async move {
            let mut bus_open = true;
            let mut storage_open = true;
            while bus_open || storage_open {
                let envelope = tokio::select! {
                    packet = bus.recv(), if bus_open => match packet {
                        Ok(packet) if packet.origin != context_id => Some(packet.envelope),
                        Ok(_) => None,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Read broadcast bus lagged, skipped {skipped} packet(s)");
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            bus_open = false;
                            None
                        }
                    },
                    event = storage.recv(), if storage_open => match event {
                        Ok(event) if event.origin != context_id => decode_storage_event(event),
                        Ok(_) => None,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Storage feed lagged, skipped {skipped} event(s)");
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            storage_open = false;
                            None
                        }
                    },
                };

                let Some(envelope) = envelope else { continue };
                if !lock(&seen).insert(&envelope.id) {
                    continue;
                }
                debug!(
                    "Applying read broadcast {} for {}",
                    envelope.id, envelope.conversation_id
                );
                apply(envelope);
            }
        })
    }
}

fn decode_storage_event(event: StorageEvent) -> Option<ReadEnvelope> {
    if event.key != READ_BROADCAST_KEY {
        return None;
    }
    let raw = event.new_value?;
    match serde_json::from_str(&raw) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            debug!("Ignoring malformed read broadcast: {e}");
            None
        }
    }
}
