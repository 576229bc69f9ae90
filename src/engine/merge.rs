use std::collections::HashSet;

use crate::models::{ConversationSystemEvent, Message};

/// Anything kept in an id-deduplicated, time-ordered log.
pub trait TimelineEntry {
    fn entry_id(&self) -> &str;
    fn created_at(&self) -> i64;
}

impl TimelineEntry for Message {
    fn entry_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

impl TimelineEntry for ConversationSystemEvent {
    fn entry_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// Merges `batch` into `list`.
///
/// Items with an empty id or an id already present (in the list or earlier in
/// the batch) are skipped. After any insertion the list is stable-sorted by
/// `(created_at, id)`. Returns the ids that were inserted, in batch order.
pub fn merge_by_id<T, I>(list: &mut Vec<T>, batch: I) -> Vec<String>
where
    T: TimelineEntry,
    I: IntoIterator<Item = T>,
{
    let mut known: HashSet<String> = list.iter().map(|e| e.entry_id().to_owned()).collect();
    let mut inserted = Vec::new();

    for item in batch {
        let id = item.entry_id();
        if id.is_empty() || known.contains(id) {
            continue;
        }
        known.insert(id.to_owned());
        inserted.push(id.to_owned());
        list.push(item);
    }

    if !inserted.is_empty() {
        list.sort_by(|a, b| {
            (a.created_at(), a.entry_id()).cmp(&(b.created_at(), b.entry_id()))
        });
    }
    inserted
}

/// One row of the rendered conversation timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Message(Message),
    Event(ConversationSystemEvent),
}

/// Interleaves two ordered logs by timestamp. A system event sharing its
/// timestamp with a message goes after that message.
pub fn interleave(messages: &[Message], events: &[ConversationSystemEvent]) -> Vec<TimelineItem> {
    let mut out = Vec::with_capacity(messages.len() + events.len());
    let (mut m, mut e) = (messages.iter().peekable(), events.iter().peekable());
    loop {
        let take_message = match (m.peek(), e.peek()) {
            (Some(msg), Some(ev)) => msg.created_at <= ev.created_at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_message {
            if let Some(msg) = m.next() {
                out.push(TimelineItem::Message(msg.clone()));
            }
        } else if let Some(ev) = e.next() {
            out.push(TimelineItem::Event(ev.clone()));
        }
    }
    out
}
