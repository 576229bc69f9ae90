use std::collections::HashMap;

use super::visibility::VisibilityGate;
use crate::models::{ClientRole, Message};
use crate::protocol::OutboundFrame;

/// Newest message in `messages` written by the other party.
///
/// `messages` must be in log order.
pub fn latest_remote(role: ClientRole, messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| role.is_remote(&m.sender_type))
}

/// Decides when to tell the server how far the reader has read.
///
/// At most one `MSG_READ` goes out per remote message id and conversation;
/// the remembered id is only advanced by [`record_sent`](Self::record_sent)
/// or [`restore`](Self::restore).
#[derive(Debug)]
pub struct ReadReceiptTracker {
    role: ClientRole,
    last_sent: HashMap<String, String>,
    visibility: VisibilityGate,
}

impl ReadReceiptTracker {
    pub fn new(role: ClientRole) -> Self {
        Self { role, last_sent: HashMap::new(), visibility: VisibilityGate::default() }
    }

    /// Builds the receipt for `conversation_id` if one is owed.
    pub fn evaluate(&self, conversation_id: &str, messages: &[Message]) -> Option<OutboundFrame> {
        if self.role == ClientRole::Visitor && !self.visibility.is_visible() {
            return None;
        }
        let newest = latest_remote(self.role, messages)?;
        if self.last_sent(conversation_id) == Some(newest.id.as_str()) {
            return None;
        }
        Some(OutboundFrame::MsgRead {
            conversation_id: conversation_id.to_string(),
            last_read_msg_id: newest.id.clone(),
        })
    }

    pub fn record_sent(&mut self, conversation_id: &str, msg_id: &str) {
        self.last_sent.insert(conversation_id.to_string(), msg_id.to_string());
    }

    /// Adopts a watermark sent earlier, by this process or a sibling.
    pub fn restore(&mut self, conversation_id: &str, msg_id: &str) {
        self.record_sent(conversation_id, msg_id);
    }

    /// Undoes a [`record_sent`](Self::record_sent) of `msg_id` whose frame
    /// never went out. A newer watermark recorded in the meantime is kept.
    pub fn release(&mut self, conversation_id: &str, msg_id: &str, previous: Option<&str>) {
        if self.last_sent(conversation_id) != Some(msg_id) {
            return;
        }
        match previous {
            Some(previous) => self.record_sent(conversation_id, previous),
            None => {
                self.last_sent.remove(conversation_id);
            }
        }
    }

    pub fn last_sent(&self, conversation_id: &str) -> Option<&str> {
        self.last_sent.get(conversation_id).map(String::as_str)
    }

    pub fn visibility_mut(&mut self) -> &mut VisibilityGate {
        &mut self.visibility
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageContent, SenderType};

    fn msg(id: &str, sender: SenderType, created_at: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: None,
            sender_type: sender,
            sender_id: None,
            content: MessageContent::Text("hi".into()),
            created_at,
            preview: None,
        }
    }

    fn read_target(frame: Option<OutboundFrame>) -> Option<String> {
        match frame {
            Some(OutboundFrame::MsgRead { last_read_msg_id, .. }) => Some(last_read_msg_id),
            _ => None,
        }
    }

    #[test]
    fn one_receipt_per_remote_message() {
        let mut tracker = ReadReceiptTracker::new(ClientRole::Agent);
        let log = vec![
            msg("m1", SenderType::Customer, 1),
            msg("m2", SenderType::Agent, 2),
        ];
        assert_eq!(read_target(tracker.evaluate("c1", &log)).as_deref(), Some("m1"));
        tracker.record_sent("c1", "m1");
        assert_eq!(tracker.evaluate("c1", &log), None);

        let mut log = log;
        log.push(msg("m3", SenderType::Customer, 3));
        assert_eq!(read_target(tracker.evaluate("c1", &log)).as_deref(), Some("m3"));
    }

    #[test]
    fn undelivered_receipt_is_owed_again() {
        let mut tracker = ReadReceiptTracker::new(ClientRole::Agent);
        let mut log = vec![msg("m1", SenderType::Customer, 1)];
        tracker.record_sent("c1", "m1");
        log.push(msg("m2", SenderType::Customer, 2));
        tracker.record_sent("c1", "m2");

        tracker.release("c1", "m2", Some("m1"));
        assert_eq!(tracker.last_sent("c1"), Some("m1"));
        assert_eq!(read_target(tracker.evaluate("c1", &log)).as_deref(), Some("m2"));

        // A newer watermark recorded meanwhile survives a stale release.
        tracker.record_sent("c1", "m2");
        tracker.release("c1", "m1", None);
        assert_eq!(tracker.last_sent("c1"), Some("m2"));

        tracker.release("c1", "m2", None);
        assert_eq!(tracker.last_sent("c1"), None);
    }

    #[test]
    fn own_messages_never_need_a_receipt() {
        let tracker = ReadReceiptTracker::new(ClientRole::Visitor);
        let log = vec![msg("m1", SenderType::Customer, 1)];
        assert_eq!(tracker.evaluate("c1", &log), None);
    }

    #[test]
    fn restored_watermark_suppresses_resend() {
        let mut tracker = ReadReceiptTracker::new(ClientRole::Visitor);
        tracker.restore("c1", "m1");
        let log = vec![msg("m1", SenderType::Agent, 1)];
        assert_eq!(tracker.evaluate("c1", &log), None);
        assert_eq!(tracker.last_sent("c1"), Some("m1"));
    }

    #[test]
    fn hidden_visitor_sends_nothing_until_visible() {
        let mut tracker = ReadReceiptTracker::new(ClientRole::Visitor);
        let log = vec![msg("m1", SenderType::Agent, 1)];
        tracker.visibility_mut().set_host(Some(false));
        assert_eq!(tracker.evaluate("c1", &log), None);
        assert!(tracker.visibility_mut().set_host(Some(true)));
        assert!(tracker.evaluate("c1", &log).is_some());
    }

    #[test]
    fn agents_ignore_visibility() {
        let mut tracker = ReadReceiptTracker::new(ClientRole::Agent);
        tracker.visibility_mut().set_host(Some(false));
        let log = vec![msg("m1", SenderType::Customer, 1)];
        assert!(tracker.evaluate("c1", &log).is_some());
    }
}
