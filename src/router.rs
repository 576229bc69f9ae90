//! Turns inbound frames into typed events.
//!
//! Unknown frame kinds and malformed payloads become [`InboundEvent::Unrecognized`]
//! so newer servers never break older clients.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::models::{AgentStatus, ConversationSystemEvent, EventKey, Message, SenderType, SessionInfo};
use crate::protocol::{decode_events, decode_message, decode_messages, opaque_id, timestamp};

/// Error codes that mean the credential is no longer usable.
const AUTH_FAILURE_CODES: &[&str] = &[
    "token_expired",
    "token_invalid",
    "invalid_token",
    "token_missing",
    "missing_token",
    "unauthorized",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    pub rid: Option<String>,
}

impl ErrorFrame {
    pub fn is_auth_failure(&self) -> bool {
        let code = self.code.to_ascii_lowercase();
        AUTH_FAILURE_CODES.contains(&code.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage {
        conversation_id: Option<String>,
        message: Message,
    },
    SyncResponse {
        conversation_id: Option<String>,
        messages: Vec<Message>,
        events: Vec<ConversationSystemEvent>,
    },
    MessageAck {
        msg_id: String,
        client_msg_id: String,
    },
    Session(SessionInfo),
    AgentStatus(AgentStatus),
    ConversationEvent {
        conversation_id: String,
        event: ConversationSystemEvent,
    },
    Typing {
        conversation_id: String,
        sender: SenderType,
        is_typing: bool,
    },
    Read {
        conversation_id: String,
        sender: SenderType,
        last_read_msg_id: String,
        read_at: Option<i64>,
    },
    Error(ErrorFrame),
    Pong,
    Unrecognized,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WireFrame {
    Msg {
        #[serde(default)]
        conversation_id: Value,
        msg: Value,
    },
    SyncRes {
        #[serde(default)]
        conversation_id: Value,
        #[serde(default)]
        messages: Option<Vec<Value>>,
        #[serde(default)]
        conversation_events: Option<Vec<Value>>,
    },
    MsgAck {
        msg_id: Value,
        client_msg_id: String,
    },
    Session(SessionInfo),
    AgentStatus(AgentStatus),
    ConvEvent {
        conversation_id: Value,
        event_id: Value,
        event_key: String,
        created_at: Value,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Error {
        code: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        rid: Value,
    },
    Pong,
    Typing {
        conversation_id: Value,
        sender_role: SenderType,
        is_typing: bool,
    },
    Read {
        conversation_id: Value,
        sender_role: SenderType,
        last_read_msg_id: Value,
        #[serde(default)]
        read_at: Value,
    },
}

/// Parses one text frame into exactly one event.
pub fn route(text: &str) -> InboundEvent {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping unrecognized frame: {e}");
            return InboundEvent::Unrecognized;
        }
    };
    from_wire(frame).unwrap_or_else(|| {
        debug!("Dropping frame with missing required fields");
        InboundEvent::Unrecognized
    })
}

fn from_wire(frame: WireFrame) -> Option<InboundEvent> {
    let event = match frame {
        WireFrame::Msg { conversation_id, msg } => InboundEvent::NewMessage {
            conversation_id: opaque_id(&conversation_id),
            message: decode_message(msg)?,
        },
        WireFrame::SyncRes { conversation_id, messages, conversation_events } => {
            InboundEvent::SyncResponse {
                conversation_id: opaque_id(&conversation_id),
                messages: decode_messages(messages.unwrap_or_default()),
                events: decode_events(conversation_events.unwrap_or_default()),
            }
        }
        WireFrame::MsgAck { msg_id, client_msg_id } => InboundEvent::MessageAck {
            msg_id: opaque_id(&msg_id)?,
            client_msg_id,
        },
        WireFrame::Session(info) => InboundEvent::Session(info),
        WireFrame::AgentStatus(status) => InboundEvent::AgentStatus(status),
        WireFrame::ConvEvent { conversation_id, event_id, event_key, created_at, data } => {
            let event = ConversationSystemEvent {
                id: opaque_id(&event_id)?,
                event_key: EventKey::from(event_key.as_str()),
                created_at: timestamp(&created_at)?,
                data,
            };
            InboundEvent::ConversationEvent {
                conversation_id: opaque_id(&conversation_id)?,
                event,
            }
        }
        WireFrame::Error { code, message, rid } => {
            InboundEvent::Error(ErrorFrame {
                code,
                message: message.unwrap_or_default(),
                rid: opaque_id(&rid),
            })
        }
        WireFrame::Pong => InboundEvent::Pong,
        WireFrame::Typing { conversation_id, sender_role, is_typing } => InboundEvent::Typing {
            conversation_id: opaque_id(&conversation_id)?,
            sender: sender_role,
            is_typing,
        },
        WireFrame::Read { conversation_id, sender_role, last_read_msg_id, read_at } => {
            InboundEvent::Read {
                conversation_id: opaque_id(&conversation_id)?,
                sender: sender_role,
                last_read_msg_id: opaque_id(&last_read_msg_id)?,
                read_at: read_at_seconds(&read_at),
            }
        }
    };
    Some(event)
}

/// `read_at` arrives either as epoch seconds or as an RFC 3339 string.
fn read_at_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp()),
        other => timestamp(other),
    }
}
