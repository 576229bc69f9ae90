use std::collections::HashMap;

use tracing::debug;

use super::merge::{interleave, merge_by_id, TimelineItem};
use super::projection::{apply_last_message, sort_summaries, status_after};
use crate::models::{
    ClientRole, ConversationSummary, ConversationSystemEvent, Message, PendingSend,
};

/// Where a message batch came from. Only live pushes count towards unread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    Live,
    Sync,
    History,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub unread_added: u32,
    /// The conversation had no summary before this merge.
    pub new_conversation: bool,
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<Message>,
    events: Vec<ConversationSystemEvent>,
    pending: Vec<PendingSend>,
}

impl ConversationLog {
    fn contains_message(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    fn settle_pending(&mut self) {
        let confirmed: Vec<String> = self
            .pending
            .iter()
            .filter_map(|p| p.acked_msg_id.clone())
            .filter(|id| self.contains_message(id))
            .collect();
        if !confirmed.is_empty() {
            self.pending
                .retain(|p| p.acked_msg_id.as_ref().map_or(true, |id| !confirmed.contains(id)));
        }
    }
}

/// Sole owner of per-conversation logs and the conversation-list projection.
///
/// Every mutation is a merge; nothing here replaces state wholesale, so
/// callers can apply pushes, history pages and user actions in any order.
#[derive(Debug)]
pub struct ReconciliationEngine {
    role: ClientRole,
    active: Option<String>,
    logs: HashMap<String, ConversationLog>,
    summaries: Vec<ConversationSummary>,
}

impl ReconciliationEngine {
    pub fn new(role: ClientRole) -> Self {
        Self { role, active: None, logs: HashMap::new(), summaries: Vec::new() }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.as_deref() == Some(conversation_id)
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// Makes `conversation_id` active and clears its unread count at once.
    pub fn select(&mut self, conversation_id: &str) {
        self.active = Some(conversation_id.to_string());
        self.summary_entry(conversation_id);
        self.mark_read(conversation_id);
    }

    pub fn clear_selection(&mut self) {
        self.active = None;
    }

    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(summary) = self.summaries.iter_mut().find(|s| s.id == conversation_id) {
            summary.unread_count = 0;
        }
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn merge_messages(
        &mut self,
        conversation_id: &str,
        batch: Vec<Message>,
        source: MergeSource,
    ) -> MergeOutcome {
        let role = self.role;
        let log = self.logs.entry(conversation_id.to_string()).or_default();
        let inserted_ids = merge_by_id(&mut log.messages, batch);
        log.settle_pending();
        if inserted_ids.is_empty() {
            return MergeOutcome::default();
        }

        let remote_inserted = if source == MergeSource::Live {
            log.messages
                .iter()
                .filter(|m| inserted_ids.contains(&m.id) && role.is_remote(&m.sender_type))
                .count() as u32
        } else {
            0
        };
        let newest = log.messages.last().cloned();

        let new_conversation = !self.summaries.iter().any(|s| s.id == conversation_id);
        let is_active = self.is_active(conversation_id);
        let summary = self.summary_entry(conversation_id);
        if let Some(newest) = &newest {
            apply_last_message(summary, newest);
        }
        let unread_added = if is_active { 0 } else { remote_inserted };
        summary.unread_count = summary.unread_count.saturating_add(unread_added);
        sort_summaries(&mut self.summaries);

        debug!(
            "Merged {} message(s) into {conversation_id} ({source:?}, +{unread_added} unread)",
            inserted_ids.len()
        );
        MergeOutcome { inserted: inserted_ids.len(), unread_added, new_conversation }
    }

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.logs.get(conversation_id).map(|l| l.messages.as_slice()).unwrap_or(&[])
    }

    pub fn last_message_id(&self, conversation_id: &str) -> Option<&str> {
        self.messages(conversation_id).last().map(|m| m.id.as_str())
    }

    // ── System events ────────────────────────────────────────────────────────

    pub fn merge_events(&mut self, conversation_id: &str, batch: Vec<ConversationSystemEvent>) -> usize {
        let log = self.logs.entry(conversation_id.to_string()).or_default();
        merge_by_id(&mut log.events, batch).len()
    }

    /// Merges a pushed timeline event and applies the status it implies.
    /// Returns whether the event was new.
    pub fn apply_conversation_event(
        &mut self,
        conversation_id: &str,
        event: ConversationSystemEvent,
    ) -> bool {
        let status = status_after(&event.event_key);
        if self.merge_events(conversation_id, vec![event]) == 0 {
            return false;
        }
        if let Some(status) = status {
            self.summary_entry(conversation_id).status = status;
            sort_summaries(&mut self.summaries);
        }
        true
    }

    pub fn events(&self, conversation_id: &str) -> &[ConversationSystemEvent] {
        self.logs.get(conversation_id).map(|l| l.events.as_slice()).unwrap_or(&[])
    }

    pub fn timeline(&self, conversation_id: &str) -> Vec<TimelineItem> {
        interleave(self.messages(conversation_id), self.events(conversation_id))
    }

    // ── Conversation list ────────────────────────────────────────────────────

    /// Merges a full inbox refresh from the server.
    ///
    /// Server counters and flags win, except that the active conversation
    /// stays read and a fresher locally-known last message is kept.
    pub fn apply_inbox(&mut self, incoming: Vec<ConversationSummary>) {
        for fresh in incoming {
            let is_active = self.is_active(&fresh.id);
            match self.summaries.iter_mut().find(|s| s.id == fresh.id) {
                Some(current) => {
                    current.status = fresh.status;
                    current.starred = fresh.starred;
                    current.unread_count = if is_active { 0 } else { fresh.unread_count };
                    let fresher = match (fresh.last_message_created_at, current.last_message_created_at) {
                        (Some(theirs), Some(ours)) => theirs > ours,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    if fresher {
                        current.last_message_id = fresh.last_message_id;
                        current.last_message_sender_type = fresh.last_message_sender_type;
                        current.last_message_content_type = fresh.last_message_content_type;
                        current.last_message_preview = fresh.last_message_preview;
                        current.last_message_created_at = fresh.last_message_created_at;
                    }
                }
                None => {
                    let mut fresh = fresh;
                    if is_active {
                        fresh.unread_count = 0;
                    }
                    self.summaries.push(fresh);
                }
            }
        }
        sort_summaries(&mut self.summaries);
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn summary(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| s.id == conversation_id)
    }

    fn summary_entry(&mut self, conversation_id: &str) -> &mut ConversationSummary {
        let index = match self.summaries.iter().position(|s| s.id == conversation_id) {
            Some(index) => index,
            None => {
                self.summaries.push(ConversationSummary::new(conversation_id));
                self.summaries.len() - 1
            }
        };
        &mut self.summaries[index]
    }

    // ── Optimistic sends ─────────────────────────────────────────────────────

    pub fn add_pending(&mut self, pending: PendingSend) {
        let log = self.logs.entry(pending.conversation_id.clone()).or_default();
        if !log.pending.iter().any(|p| p.client_msg_id == pending.client_msg_id) {
            log.pending.push(pending);
        }
    }

    /// Records the server id for an optimistic send. Returns false for an
    /// unknown client id.
    pub fn acknowledge(&mut self, client_msg_id: &str, msg_id: &str) -> bool {
        for log in self.logs.values_mut() {
            if let Some(pending) = log.pending.iter_mut().find(|p| p.client_msg_id == client_msg_id) {
                pending.acked_msg_id = Some(msg_id.to_string());
                log.settle_pending();
                return true;
            }
        }
        false
    }

    pub fn pending(&self, conversation_id: &str) -> &[PendingSend] {
        self.logs.get(conversation_id).map(|l| l.pending.as_slice()).unwrap_or(&[])
    }

    pub fn find_pending(&self, client_msg_id: &str) -> Option<&PendingSend> {
        self.logs
            .values()
            .flat_map(|l| l.pending.iter())
            .find(|p| p.client_msg_id == client_msg_id)
    }
}
