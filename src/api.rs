//! HTTP collaborator: session bootstrap, inbox and history pages, presigned
//! upload/download URLs. Failures are returned to the caller; nothing here
//! retries.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::{ClientRole, ConversationSummary, Message};
use crate::protocol::decode_messages;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionGrant {
    pub token: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub attachment_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest {
    pub conversation_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    client: ClientRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_id: Option<&'a str>,
}

/// The slice of the HTTP API the sync service needs.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, AppError>;

    /// One page of history, newest page first when `before` is `None`.
    async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<Message>, AppError>;
}

#[derive(Debug, Clone)]
pub struct ChatApi {
    client: Client,
    base: String,
    token: Option<String>,
}

impl ChatApi {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { client: Client::new(), base, token }
    }

    /// Exchanges the ambient credentials for a socket token.
    pub async fn bootstrap_session(
        &self,
        role: ClientRole,
        site_id: Option<&str>,
    ) -> Result<SessionGrant, AppError> {
        let url = format!("{}/session", self.base);
        let request = self.client.post(&url).json(&SessionRequest { client: role, site_id });
        self.execute(&url, request).await
    }

    /// Returns the conversation list.
    pub async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, AppError> {
        let url = format!("{}/conversations", self.base);
        let request = self.client.get(&url);
        self.execute(&url, request).await
    }

    /// Returns one page of messages; malformed items are skipped.
    pub async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<Message>, AppError> {
        let url = format!("{}/conversations/{conversation_id}/messages", self.base);
        let mut request = self.client.get(&url);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        let items: Vec<Value> = self.execute(&url, request).await?;
        let total = items.len();
        let messages = decode_messages(items);
        if messages.len() != total {
            debug!("Skipped {} malformed history item(s) for {conversation_id}", total - messages.len());
        }
        Ok(messages)
    }

    pub async fn presign_upload(&self, upload: &UploadRequest) -> Result<PresignedUrl, AppError> {
        let url = format!("{}/uploads/presign", self.base);
        let request = self.client.post(&url).json(upload);
        self.execute(&url, request).await
    }

    pub async fn presign_download(&self, attachment_id: &str) -> Result<PresignedUrl, AppError> {
        let url = format!("{}/attachments/{attachment_id}/presign", self.base);
        let request = self.client.get(&url);
        self.execute(&url, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        url: &str,
        request: RequestBuilder,
    ) -> Result<T, AppError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let resp = request.send().await.map_err(|e| {
            error!("Request to {url} failed: {e}");
            AppError::http(url, e)
        })?;

        let status = resp.status();
        if !status.is_success() {
            error!("Server returned {status} for {url}");
            return Err(AppError::ServerStatus { url: url.to_string(), status: status.as_u16() });
        }

        let body = resp.text().await.map_err(|e| AppError::http(url, e))?;
        serde_json::from_str(&body).map_err(|e| AppError::decode(format!("response from {url}"), e))
    }
}

#[async_trait]
impl ChatBackend for ChatApi {
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, AppError> {
        ChatApi::fetch_conversations(self).await
    }

    async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<Message>, AppError> {
        ChatApi::fetch_history(self, conversation_id, before).await
    }
}
