use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::AppError;

/// Which side of the conversation this client speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Agent,
    Visitor,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Agent => "agent",
            ClientRole::Visitor => "visitor",
        }
    }

    /// True when `sender` is the party on the other side of the conversation.
    pub fn is_remote(&self, sender: &SenderType) -> bool {
        match self {
            ClientRole::Agent => *sender == SenderType::Customer,
            ClientRole::Visitor => *sender == SenderType::Agent,
        }
    }

    /// True when `sender` speaks for the same side as this client.
    pub fn is_own(&self, sender: &SenderType) -> bool {
        match self {
            ClientRole::Agent => *sender == SenderType::Agent,
            ClientRole::Visitor => *sender == SenderType::Customer,
        }
    }
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ClientRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(ClientRole::Agent),
            "visitor" => Ok(ClientRole::Visitor),
            other => Err(format!("Unknown client role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Agent,
    #[serde(alias = "visitor")]
    Customer,
    System,
    Bot,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub attachment_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    File(FileAttachment),
}

impl MessageContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            MessageContent::Text(_) => ContentType::Text,
            MessageContent::File(_) => ContentType::File,
        }
    }

    /// Wire representation of the `content` field.
    pub fn to_value(&self) -> Value {
        match self {
            MessageContent::Text(text) => Value::String(text.clone()),
            MessageContent::File(file) => serde_json::to_value(file).unwrap_or(Value::Null),
        }
    }
}

/// A chat message as received from the server. Immutable once merged.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: Option<String>,
    pub sender_type: SenderType,
    pub sender_id: Option<String>,
    pub content: MessageContent,
    /// Seconds since the epoch, assigned by the server.
    pub created_at: i64,
    /// Preview text computed by the server, preferred over a local one.
    pub preview: Option<String>,
}

impl Message {
    pub fn content_type(&self) -> ContentType {
        self.content.content_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKey {
    Started,
    Idle,
    Assigned,
    Claimed,
    Transferred,
    Archived,
    Reopened,
    PageView,
    Other(String),
}

impl EventKey {
    pub fn as_str(&self) -> &str {
        match self {
            EventKey::Started => "started",
            EventKey::Idle => "idle",
            EventKey::Assigned => "assigned",
            EventKey::Claimed => "claimed",
            EventKey::Transferred => "transferred",
            EventKey::Archived => "archived",
            EventKey::Reopened => "reopened",
            EventKey::PageView => "page_view",
            EventKey::Other(key) => key,
        }
    }
}

impl From<&str> for EventKey {
    fn from(key: &str) -> Self {
        match key {
            "started" => EventKey::Started,
            "idle" => EventKey::Idle,
            "assigned" => EventKey::Assigned,
            "claimed" => EventKey::Claimed,
            "transferred" => EventKey::Transferred,
            "archived" => EventKey::Archived,
            "reopened" => EventKey::Reopened,
            "page_view" => EventKey::PageView,
            other => EventKey::Other(other.to_string()),
        }
    }
}

/// A server-generated timeline entry (assignment, archive, page view, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSystemEvent {
    pub id: String,
    pub event_key: EventKey,
    pub created_at: i64,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Open,
    Pending,
    Closed,
    #[serde(other)]
    Unknown,
}

/// Conversation-list projection. Derived from messages and server deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub last_message_sender_type: Option<SenderType>,
    #[serde(default)]
    pub last_message_content_type: Option<ContentType>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_created_at: Option<i64>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub starred: bool,
}

impl ConversationSummary {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ConversationStatus::Open,
            last_message_id: None,
            last_message_sender_type: None,
            last_message_content_type: None,
            last_message_preview: None,
            last_message_created_at: None,
            unread_count: 0,
            starred: false,
        }
    }
}

/// An outbound message shown optimistically until the server echoes it back.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub client_msg_id: String,
    pub conversation_id: String,
    pub content: MessageContent,
    pub queued_at: DateTime<Utc>,
    pub acked_msg_id: Option<String>,
}

impl PendingSend {
    pub fn new(conversation_id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            client_msg_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            content,
            queued_at: Utc::now(),
            acked_msg_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWatermark {
    pub id: String,
    pub at: DateTime<Utc>,
}

/// Last read position reported by the other party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRead {
    pub last_read_msg_id: String,
    pub read_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub heartbeat_interval_seconds: u64,
    #[serde(default)]
    pub heartbeat_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub user_id: String,
    pub status: String,
    pub effective_status: String,
    pub max_concurrent: u32,
    pub assigned_active: u32,
    pub remaining_capacity: u32,
    pub can_accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorIdentity {
    pub name: String,
    pub email: String,
}

impl VisitorIdentity {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "name".to_string() });
        }
        if self.email.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "email".to_string() });
        }
        Ok(())
    }
}
