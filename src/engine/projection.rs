//! Conversation-list projection helpers.

use std::cmp::Ordering;

use crate::models::{ConversationStatus, ConversationSummary, EventKey, Message, MessageContent};

/// Preview shown in the conversation list for `message`.
pub fn preview_text(message: &Message) -> String {
    if let Some(preview) = message.preview.as_deref().filter(|p| !p.trim().is_empty()) {
        return preview.to_string();
    }
    match &message.content {
        MessageContent::Text(text) => collapse_whitespace(text),
        MessageContent::File(file) if !file.filename.is_empty() => format!("[{}]", file.filename),
        MessageContent::File(_) => "[file]".to_string(),
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Points the summary at `message` if it is at least as new as the current
/// last message. Returns whether the summary changed.
pub fn apply_last_message(summary: &mut ConversationSummary, message: &Message) -> bool {
    let newer = match (summary.last_message_created_at, summary.last_message_id.as_deref()) {
        (Some(at), Some(id)) => (message.created_at, message.id.as_str()) > (at, id),
        (Some(at), None) => message.created_at >= at,
        (None, _) => true,
    };
    if newer {
        summary.last_message_id = Some(message.id.clone());
        summary.last_message_sender_type = Some(message.sender_type.clone());
        summary.last_message_content_type = Some(message.content_type());
        summary.last_message_preview = Some(preview_text(message));
        summary.last_message_created_at = Some(message.created_at);
    }
    newer
}

/// `(last_message_created_at desc, id asc)`; conversations without messages last.
pub fn sort_summaries(list: &mut [ConversationSummary]) {
    list.sort_by(|a, b| {
        let by_time = match (a.last_message_created_at, b.last_message_created_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time.then_with(|| a.id.cmp(&b.id))
    });
}

/// Status implied by a timeline event, if any.
pub fn status_after(event_key: &EventKey) -> Option<ConversationStatus> {
    match event_key {
        EventKey::Archived => Some(ConversationStatus::Closed),
        EventKey::Reopened | EventKey::Started | EventKey::Assigned | EventKey::Claimed => {
            Some(ConversationStatus::Open)
        }
        _ => None,
    }
}
