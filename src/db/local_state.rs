use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::kv_store::KeyValueStore;
use crate::models::{ClientRole, ReadWatermark, SessionInfo, VisitorIdentity};

const DRAFT_PREFIX: &str = "livechat:draft:";
const READ_PREFIX: &str = "livechat:read:";
const VISITOR_KEY: &str = "livechat:visitor";
const ACTIVE_CONVERSATION_KEY: &str = "livechat:active_conversation";
const SITE_KEY: &str = "livechat:site";
const SESSION_KEY: &str = "livechat:session";

/// Typed, best-effort view over the durable store.
///
/// Nothing here fails: storage errors are logged and reads fall back to
/// "absent", so a broken disk degrades to an ephemeral client.
#[derive(Clone)]
pub struct LocalState {
    store: Arc<dyn KeyValueStore>,
    role: ClientRole,
    site_id: Option<String>,
}

impl LocalState {
    pub fn new(store: Arc<dyn KeyValueStore>, role: ClientRole, site_id: Option<String>) -> Self {
        Self { store, role, site_id }
    }

    // ── Drafts ───────────────────────────────────────────────────────────────

    pub async fn draft(&self, conversation_id: &str) -> Option<String> {
        self.read_raw(&format!("{DRAFT_PREFIX}{conversation_id}")).await
    }

    /// An empty draft removes the entry.
    pub async fn save_draft(&self, conversation_id: &str, text: &str) {
        let key = format!("{DRAFT_PREFIX}{conversation_id}");
        if text.is_empty() {
            self.remove(&key).await;
        } else {
            self.write_raw(&key, text).await;
        }
    }

    // ── Read watermarks ──────────────────────────────────────────────────────

    /// Agents key by conversation; visitors also scope by site, since one
    /// visitor store can serve several sites.
    pub fn read_key(&self, conversation_id: &str) -> String {
        match (self.role, self.site_id.as_deref()) {
            (ClientRole::Visitor, Some(site)) => format!("{READ_PREFIX}{site}:{conversation_id}"),
            _ => format!("{READ_PREFIX}{conversation_id}"),
        }
    }

    pub async fn read_watermark(&self, conversation_id: &str) -> Option<ReadWatermark> {
        self.read_json(&self.read_key(conversation_id)).await
    }

    pub async fn save_read_watermark(&self, conversation_id: &str, msg_id: &str) {
        let watermark = ReadWatermark { id: msg_id.to_string(), at: Utc::now() };
        self.write_json(&self.read_key(conversation_id), &watermark).await;
    }

    // ── Visitor / site / selection ───────────────────────────────────────────

    pub async fn visitor_identity(&self) -> Option<VisitorIdentity> {
        self.read_json(VISITOR_KEY).await
    }

    pub async fn save_visitor_identity(&self, identity: &VisitorIdentity) {
        self.write_json(VISITOR_KEY, identity).await;
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.read_raw(ACTIVE_CONVERSATION_KEY).await
    }

    pub async fn save_active_conversation(&self, conversation_id: Option<&str>) {
        match conversation_id {
            Some(id) => self.write_raw(ACTIVE_CONVERSATION_KEY, id).await,
            None => self.remove(ACTIVE_CONVERSATION_KEY).await,
        }
    }

    pub async fn site(&self) -> Option<String> {
        self.read_raw(SITE_KEY).await
    }

    pub async fn save_site(&self, site_id: &str) {
        self.write_raw(SITE_KEY, site_id).await;
    }

    // ── Session ──────────────────────────────────────────────────────────────

    pub async fn session(&self) -> Option<SessionInfo> {
        self.read_json(SESSION_KEY).await
    }

    pub async fn save_session(&self, session: &SessionInfo) {
        self.write_json(SESSION_KEY, session).await;
    }

    pub async fn clear_session(&self) {
        self.remove(SESSION_KEY).await;
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    async fn read_raw(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {key} from local state: {e}");
                None
            }
        }
    }

    async fn write_raw(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value).await {
            warn!("Failed to write {key} to local state: {e}");
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            warn!("Failed to remove {key} from local state: {e}");
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable {key} in local state: {e}");
                None
            }
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.write_raw(key, &raw).await,
            Err(e) => warn!("Failed to encode {key} for local state: {e}"),
        }
    }
}
