//! Wire format shared by the connection manager and the event router.
//!
//! Every frame is one JSON object discriminated by its `"type"` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{
    ClientRole, ContentType, ConversationSystemEvent, EventKey, FileAttachment, Message,
    MessageContent, SenderType,
};

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundFrame {
    Auth {
        token: String,
        client: ClientRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Sub {
        conversation_id: String,
    },
    Unsub {
        conversation_id: String,
    },
    Sync {
        conversation_id: String,
        after_msg_id: Option<String>,
    },
    MsgSend {
        conversation_id: String,
        client_msg_id: String,
        content_type: ContentType,
        content: Value,
    },
    MsgRead {
        conversation_id: String,
        last_read_msg_id: String,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    Ping,
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Auth { .. } => "AUTH",
            OutboundFrame::Sub { .. } => "SUB",
            OutboundFrame::Unsub { .. } => "UNSUB",
            OutboundFrame::Sync { .. } => "SYNC",
            OutboundFrame::MsgSend { .. } => "MSG_SEND",
            OutboundFrame::MsgRead { .. } => "MSG_READ",
            OutboundFrame::Typing { .. } => "TYPING",
            OutboundFrame::Ping => "PING",
        }
    }

    pub fn send_message(
        conversation_id: impl Into<String>,
        client_msg_id: impl Into<String>,
        content: &MessageContent,
    ) -> Self {
        OutboundFrame::MsgSend {
            conversation_id: conversation_id.into(),
            client_msg_id: client_msg_id.into(),
            content_type: content.content_type(),
            content: content.to_value(),
        }
    }
}

// ── Item decoding ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    conversation_id: Value,
    #[serde(default = "unknown_sender")]
    sender_type: SenderType,
    #[serde(default)]
    sender_id: Value,
    #[serde(default)]
    content_type: Option<ContentType>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    created_at: Value,
    #[serde(default)]
    preview: Option<String>,
}

fn unknown_sender() -> SenderType {
    SenderType::Unknown
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    event_id: Value,
    event_key: String,
    #[serde(default)]
    created_at: Value,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Ids are opaque; servers may send them as strings or numbers.
pub(crate) fn opaque_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn timestamp(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn decode_content(content_type: Option<ContentType>, content: Value) -> Option<MessageContent> {
    match (content_type, content) {
        (Some(ContentType::Text) | None, Value::String(text)) => Some(MessageContent::Text(text)),
        (Some(ContentType::File) | None, value @ Value::Object(_)) => {
            serde_json::from_value::<FileAttachment>(value).ok().map(MessageContent::File)
        }
        _ => None,
    }
}

/// Decodes one message item. Items without an id or usable content yield `None`.
pub fn decode_message(value: Value) -> Option<Message> {
    let wire: WireMessage = serde_json::from_value(value).ok()?;
    let id = opaque_id(&wire.id)?;
    let content = decode_content(wire.content_type, wire.content)?;
    Some(Message {
        id,
        conversation_id: opaque_id(&wire.conversation_id),
        sender_type: wire.sender_type,
        sender_id: opaque_id(&wire.sender_id),
        content,
        created_at: timestamp(&wire.created_at)?,
        preview: wire.preview,
    })
}

/// Decodes a batch, skipping malformed items.
pub fn decode_messages(values: Vec<Value>) -> Vec<Message> {
    values.into_iter().filter_map(decode_message).collect()
}

pub fn decode_event(value: Value) -> Option<ConversationSystemEvent> {
    let wire: WireEvent = serde_json::from_value(value).ok()?;
    Some(ConversationSystemEvent {
        id: opaque_id(&wire.id).or_else(|| opaque_id(&wire.event_id))?,
        event_key: EventKey::from(wire.event_key.as_str()),
        created_at: timestamp(&wire.created_at)?,
        data: wire.data,
    })
}

pub fn decode_events(values: Vec<Value>) -> Vec<ConversationSystemEvent> {
    values.into_iter().filter_map(decode_event).collect()
}
