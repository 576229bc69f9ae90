use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use crate::connection::FrameSink;
use crate::lock;
use crate::protocol::OutboundFrame;
use crate::timer::ScheduledTask;

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(1200);
pub const DEFAULT_PEER_TYPING_TTL: Duration = Duration::from_secs(6);

// ── Local typing ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct TypingInner {
    conversation: Option<String>,
    active: bool,
    generation: u64,
    idle: ScheduledTask,
}

/// Derives `TYPING` frames from draft edits.
///
/// The first non-empty draft announces typing at once, an idle timer that
/// restarts on every edit retracts it, and clearing the draft retracts it
/// immediately. Cloning shares the state.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Mutex<TypingInner>>,
    sink: Arc<dyn FrameSink>,
    idle_after: Duration,
}

impl TypingTracker {
    pub fn new(sink: Arc<dyn FrameSink>, idle_after: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(TypingInner::default())), sink, idle_after }
    }

    pub fn on_draft_change(&self, conversation_id: &str, text: &str) {
        let mut inner = lock(&self.inner);
        if inner.conversation.as_deref() != Some(conversation_id) {
            // A different conversation starts from scratch; the old one is
            // left to expire on the server side.
            inner.idle.cancel();
            inner.active = false;
            inner.conversation = Some(conversation_id.to_string());
        }
        inner.generation += 1;

        if text.trim().is_empty() {
            inner.idle.cancel();
            if inner.active {
                inner.active = false;
                self.emit(conversation_id, false);
            }
            return;
        }

        if !inner.active {
            inner.active = true;
            self.emit(conversation_id, true);
        }
        let generation = inner.generation;
        let weak = Arc::downgrade(&self.inner);
        let sink = Arc::clone(&self.sink);
        let conversation = conversation_id.to_string();
        inner.idle.start(self.idle_after, move || {
            Self::expire(weak, sink, generation, &conversation);
        });
    }

    /// Stops the idle timer without telling the server anything.
    pub fn cancel(&self) {
        let mut inner = lock(&self.inner);
        inner.idle.cancel();
        inner.active = false;
        inner.generation += 1;
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.inner).active
    }

    fn expire(weak: Weak<Mutex<TypingInner>>, sink: Arc<dyn FrameSink>, generation: u64, conversation_id: &str) {
        let Some(inner) = weak.upgrade() else { return };
        let mut inner = lock(&inner);
        if inner.generation != generation || !inner.active {
            return;
        }
        inner.active = false;
        sink.send_frame(OutboundFrame::Typing {
            conversation_id: conversation_id.to_string(),
            is_typing: false,
        });
    }

    fn emit(&self, conversation_id: &str, is_typing: bool) {
        let sent = self.sink.send_frame(OutboundFrame::Typing {
            conversation_id: conversation_id.to_string(),
            is_typing,
        });
        if !sent {
            debug!("Dropped typing={is_typing} for {conversation_id}: not connected");
        }
    }
}

// ── Remote typing ────────────────────────────────────────────────────────────

type ExpiryHook = Arc<dyn Fn(&str) + Send + Sync>;

struct PeerEntry {
    generation: u64,
    expiry: ScheduledTask,
}

#[derive(Default)]
struct PeerInner {
    typing: HashMap<String, PeerEntry>,
    generation: u64,
}

/// Remote party's typing flag per conversation, cleared by a local timer
/// when the server stops refreshing it.
#[derive(Clone)]
pub struct PeerTyping {
    inner: Arc<Mutex<PeerInner>>,
    ttl: Duration,
    on_expire: Option<ExpiryHook>,
}

impl PeerTyping {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(PeerInner::default())), ttl, on_expire: None }
    }

    /// Called with the conversation id whenever a flag times out.
    pub fn with_expiry_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(hook));
        self
    }

    /// Applies a remote `TYPING` frame. Returns whether the flag flipped.
    pub fn update(&self, conversation_id: &str, is_typing: bool) -> bool {
        let mut inner = lock(&self.inner);
        if !is_typing {
            return inner.typing.remove(conversation_id).is_some();
        }

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Arc::downgrade(&self.inner);
        let hook = self.on_expire.clone();
        let conversation = conversation_id.to_string();
        let was_typing = inner.typing.contains_key(conversation_id);
        let entry = inner
            .typing
            .entry(conversation_id.to_string())
            .or_insert_with(|| PeerEntry { generation, expiry: ScheduledTask::new() });
        entry.generation = generation;
        entry.expiry.start(self.ttl, move || {
            let Some(inner) = weak.upgrade() else { return };
            let expired = {
                let mut inner = lock(&inner);
                let current = inner.typing.get(&conversation).map(|e| e.generation);
                if current == Some(generation) {
                    // Drops this task's own handle; the abort only lands at
                    // the next await, of which there is none.
                    inner.typing.remove(&conversation);
                    true
                } else {
                    false
                }
            };
            if expired {
                if let Some(hook) = hook {
                    hook(&conversation);
                }
            }
        });
        !was_typing
    }

    pub fn is_typing(&self, conversation_id: &str) -> bool {
        lock(&self.inner).typing.contains_key(conversation_id)
    }

    pub fn clear(&self) {
        lock(&self.inner).typing.clear();
    }
}
