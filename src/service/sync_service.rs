use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::ChatBackend;
use crate::broadcast::{BroadcastCoordinator, ReadEnvelope, SharedContexts};
use crate::config::SyncConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionState, Connector};
use crate::db::{LocalState, MemoryStore};
use crate::engine::{MergeSource, ReconciliationEngine, TimelineItem};
use crate::errors::AppError;
use crate::lock;
use crate::models::{
    AgentStatus, ClientRole, ConversationSummary, FileAttachment, Message, MessageContent,
    PeerRead, PendingSend, VisitorIdentity,
};
use crate::presence::{PeerTyping, ReadReceiptTracker, TypingTracker};
use crate::protocol::OutboundFrame;
use crate::router::{route, ErrorFrame, InboundEvent};
use super::remote::Remote;

const MAX_MESSAGE_LENGTH: usize = 8000;
const NOTIFICATION_CAPACITY: usize = 256;

/// Collaborators a service is built from.
#[derive(Clone)]
pub struct SyncDeps {
    pub connector: Arc<dyn Connector>,
    pub shared: SharedContexts,
    pub backend: Option<Arc<dyn ChatBackend>>,
}

impl SyncDeps {
    /// No HTTP backend and a process-local store.
    pub fn in_memory(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: SharedContexts::new(Arc::new(MemoryStore::new())),
            backend: None,
        }
    }
}

/// State changes readers may want to re-render on.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    ConversationUpdated { conversation_id: String },
    InboxChanged,
    PeerTyping { conversation_id: String, is_typing: bool },
    PeerRead { conversation_id: String, last_read_msg_id: String },
    SendAcknowledged { client_msg_id: String, msg_id: String },
    AgentStatus(AgentStatus),
    Connection(ConnectionState),
    /// The server refused the credential; the connection stays closed.
    AuthRevoked { code: String, message: String },
}

struct Inner {
    config: SyncConfig,
    connection: ConnectionHandle,
    engine: Mutex<ReconciliationEngine>,
    receipts: Mutex<ReadReceiptTracker>,
    typing: TypingTracker,
    peer_typing: PeerTyping,
    peer_reads: Mutex<HashMap<String, PeerRead>>,
    agent_status: Mutex<Option<AgentStatus>>,
    drafts: Mutex<HashMap<String, String>>,
    local: LocalState,
    broadcast: BroadcastCoordinator,
    remote: Remote,
    notifications: broadcast::Sender<SyncNotification>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One client context: a connection, its reconciled state and the presence
/// signals around it. Cloning shares the context.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    /// Builds the context and starts its background tasks. The connection is
    /// not opened until [`connect`](Self::connect).
    pub async fn start(config: SyncConfig, deps: SyncDeps) -> Result<Self, AppError> {
        let site_id = match &config.site_id {
            Some(site) => Some(site.clone()),
            None => LocalState::new(deps.shared.store(), config.role, None).site().await,
        };
        let local = LocalState::new(deps.shared.store(), config.role, site_id);
        if let Some(site) = &config.site_id {
            local.save_site(site).await;
        }

        let session = local.session().await;
        let mut settings = config.connection_settings(session.as_ref().map(|s| s.session_id.clone()));
        if let Some(session) = &session {
            if session.heartbeat_interval_seconds > 0 {
                settings.heartbeat_interval = Duration::from_secs(session.heartbeat_interval_seconds);
            }
            debug!("Resuming session {}", session.session_id);
        }

        let (connection, events) = ConnectionHandle::spawn(settings, deps.connector);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let expiry_notifications = notifications.clone();
        let peer_typing = PeerTyping::new(config.peer_typing_ttl).with_expiry_hook(move |conversation_id| {
            let _ = expiry_notifications.send(SyncNotification::PeerTyping {
                conversation_id: conversation_id.to_string(),
                is_typing: false,
            });
        });

        let inner = Arc::new(Inner {
            typing: TypingTracker::new(Arc::new(connection.clone()), config.typing_idle),
            engine: Mutex::new(ReconciliationEngine::new(config.role)),
            receipts: Mutex::new(ReadReceiptTracker::new(config.role)),
            peer_typing,
            peer_reads: Mutex::new(HashMap::new()),
            agent_status: Mutex::new(None),
            drafts: Mutex::new(HashMap::new()),
            local,
            broadcast: BroadcastCoordinator::new(deps.shared),
            remote: Remote::new(deps.backend, config.inbox_refresh_debounce),
            notifications,
            tasks: Mutex::new(Vec::new()),
            connection,
            config,
        });

        let pump = tokio::spawn(Inner::pump(Arc::downgrade(&inner), events));
        let weak = Arc::downgrade(&inner);
        let listener = inner.broadcast.listen(move |envelope| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_sibling_read(envelope);
            }
        });
        lock(&inner.tasks).extend([pump, listener]);

        info!("Sync service started for {}", inner.config.role);
        Ok(Self { inner })
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    /// Reconnects with a fresh credential, typically after
    /// [`SyncNotification::AuthRevoked`]. The old session is not resumed.
    pub fn reauthenticate(&self, token: impl Into<String>) {
        self.inner.connection.set_token(token);
        self.inner.connection.connect();
    }

    /// Closes the connection and stops reconnecting. State is kept.
    pub fn close(&self) {
        self.inner.typing.cancel();
        self.inner.connection.close();
    }

    /// Stops every background task of this context.
    pub fn shutdown(&self) {
        self.inner.typing.cancel();
        self.inner.peer_typing.clear();
        self.inner.remote.cancel();
        self.inner.connection.shutdown();
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        info!("Sync service for {} shut down", self.inner.config.role);
    }

    pub fn notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.inner.notifications.subscribe()
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Makes `conversation_id` the one being read: unread drops to zero at
    /// once, the conversation is subscribed and caught up, and a read receipt
    /// goes out if one is owed.
    pub async fn select_conversation(&self, conversation_id: &str) {
        let inner = &self.inner;
        inner.typing.cancel();
        lock(&inner.engine).select(conversation_id);
        inner.connection.subscribe(conversation_id);
        inner.notify(SyncNotification::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });

        if let Some(watermark) = inner.local.read_watermark(conversation_id).await {
            lock(&inner.receipts).restore(conversation_id, &watermark.id);
        }
        if let Some(draft) = inner.local.draft(conversation_id).await {
            lock(&inner.drafts).insert(conversation_id.to_string(), draft);
        }
        inner.local.save_active_conversation(Some(conversation_id)).await;

        inner.request_sync(conversation_id);
        inner.evaluate_receipt(conversation_id).await;
    }

    /// Re-selects the conversation that was active when the last context
    /// using this store went away.
    pub async fn restore_selection(&self) -> Option<String> {
        let conversation_id = self.inner.local.active_conversation().await?;
        self.select_conversation(&conversation_id).await;
        Some(conversation_id)
    }

    pub async fn clear_selection(&self) {
        self.inner.typing.cancel();
        lock(&self.inner.engine).clear_selection();
        self.inner.local.save_active_conversation(None).await;
    }

    /// Fetches one page of history over HTTP and merges it. Returns the number
    /// of messages that were new.
    pub async fn load_history(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<usize, AppError> {
        let page = self.inner.remote.history(conversation_id, before).await?;
        let outcome = lock(&self.inner.engine).merge_messages(conversation_id, page, MergeSource::History);
        if outcome.inserted > 0 {
            self.inner.notify(SyncNotification::ConversationUpdated {
                conversation_id: conversation_id.to_string(),
            });
            self.inner.evaluate_receipt(conversation_id).await;
        }
        Ok(outcome.inserted)
    }

    /// Loads the page before the oldest message held locally.
    pub async fn load_older(&self, conversation_id: &str) -> Result<usize, AppError> {
        let oldest = lock(&self.inner.engine)
            .messages(conversation_id)
            .first()
            .map(|m| m.id.clone());
        self.load_history(conversation_id, oldest.as_deref()).await
    }

    pub async fn refresh_inbox(&self) -> Result<(), AppError> {
        self.inner.refresh_inbox().await
    }

    /// Coalesces bursts of refresh requests into one fetch.
    pub fn request_inbox_refresh(&self) {
        self.inner.request_inbox_refresh();
    }

    pub fn set_subscriptions<I, S>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.connection.set_subscriptions(conversation_ids);
    }

    // ── Composing ────────────────────────────────────────────────────────────

    pub async fn update_draft(&self, conversation_id: &str, text: &str) {
        {
            let mut drafts = lock(&self.inner.drafts);
            if text.is_empty() {
                drafts.remove(conversation_id);
            } else {
                drafts.insert(conversation_id.to_string(), text.to_string());
            }
        }
        self.inner.typing.on_draft_change(conversation_id, text);
        self.inner.local.save_draft(conversation_id, text).await;
    }

    pub fn draft(&self, conversation_id: &str) -> Option<String> {
        lock(&self.inner.drafts).get(conversation_id).cloned()
    }

    /// Queues a text message optimistically and sends it if connected.
    ///
    /// The pending entry stays visible until the server echo is merged. A
    /// message that could not be sent stays pending for [`retry_send`](Self::retry_send).
    pub async fn send_text(&self, conversation_id: &str, text: &str) -> Result<PendingSend, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        let length = text.chars().count();
        if length > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: length,
            });
        }

        let pending = self.inner.enqueue(conversation_id, MessageContent::Text(text.to_string()));
        self.update_draft(conversation_id, "").await;
        Ok(pending)
    }

    /// Sends a reference to an already uploaded file.
    pub fn send_attachment(
        &self,
        conversation_id: &str,
        attachment: FileAttachment,
    ) -> Result<PendingSend, AppError> {
        if attachment.attachment_id.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "attachment_id".to_string() });
        }
        Ok(self.inner.enqueue(conversation_id, MessageContent::File(attachment)))
    }

    /// Re-sends a pending message under its original client id, so a late
    /// echo of the first attempt still settles it. Returns whether a frame
    /// went out.
    pub fn retry_send(&self, client_msg_id: &str) -> Result<bool, AppError> {
        let pending = lock(&self.inner.engine)
            .find_pending(client_msg_id)
            .cloned()
            .ok_or_else(|| AppError::PendingNotFound { client_msg_id: client_msg_id.to_string() })?;
        let frame = OutboundFrame::send_message(
            &pending.conversation_id,
            &pending.client_msg_id,
            &pending.content,
        );
        Ok(self.inner.connection.send(frame))
    }

    pub async fn visitor_identity(&self) -> Option<VisitorIdentity> {
        self.inner.local.visitor_identity().await
    }

    /// Remembers the name and email a visitor entered so later sessions can
    /// skip the pre-chat form.
    pub async fn save_visitor_identity(&self, identity: &VisitorIdentity) -> Result<(), AppError> {
        identity.validate()?;
        self.inner.local.save_visitor_identity(identity).await;
        Ok(())
    }

    // ── Visibility ───────────────────────────────────────────────────────────

    pub async fn set_host_visibility(&self, visible: Option<bool>) {
        let became_visible = lock(&self.inner.receipts).visibility_mut().set_host(visible);
        self.inner.on_visibility_change(became_visible).await;
    }

    pub async fn set_document_visible(&self, visible: bool) {
        let became_visible = lock(&self.inner.receipts).visibility_mut().set_document_visible(visible);
        self.inner.on_visibility_change(became_visible).await;
    }

    pub async fn set_document_focused(&self, focused: bool) {
        let became_visible = lock(&self.inner.receipts).visibility_mut().set_document_focused(focused);
        self.inner.on_visibility_change(became_visible).await;
    }

    // ── Readers ──────────────────────────────────────────────────────────────

    pub fn role(&self) -> ClientRole {
        self.inner.config.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn active_conversation(&self) -> Option<String> {
        lock(&self.inner.engine).active().map(str::to_string)
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        lock(&self.inner.engine).messages(conversation_id).to_vec()
    }

    pub fn timeline(&self, conversation_id: &str) -> Vec<TimelineItem> {
        lock(&self.inner.engine).timeline(conversation_id)
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        lock(&self.inner.engine).summaries().to_vec()
    }

    pub fn summary(&self, conversation_id: &str) -> Option<ConversationSummary> {
        lock(&self.inner.engine).summary(conversation_id).cloned()
    }

    pub fn pending(&self, conversation_id: &str) -> Vec<PendingSend> {
        lock(&self.inner.engine).pending(conversation_id).to_vec()
    }

    pub fn is_peer_typing(&self, conversation_id: &str) -> bool {
        self.inner.peer_typing.is_typing(conversation_id)
    }

    pub fn peer_read(&self, conversation_id: &str) -> Option<PeerRead> {
        lock(&self.inner.peer_reads).get(conversation_id).cloned()
    }

    pub fn agent_status(&self) -> Option<AgentStatus> {
        lock(&self.inner.agent_status).clone()
    }

    /// Last message id a read receipt was sent (or adopted) for.
    pub fn read_watermark(&self, conversation_id: &str) -> Option<String> {
        lock(&self.inner.receipts).last_sent(conversation_id).map(str::to_string)
    }
}

impl Inner {
    // ── Inbound ──────────────────────────────────────────────────────────────

    async fn pump(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match event {
                ConnectionEvent::Frame(text) => inner.handle_inbound(route(&text)).await,
                ConnectionEvent::State(state) => inner.notify(SyncNotification::Connection(state)),
                ConnectionEvent::Ready => inner.on_ready().await,
            }
        }
        debug!("Connection event pump stopped");
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage { conversation_id, message } => {
                let fallback = message.conversation_id.clone();
                let Some(conversation_id) = self.resolve_conversation(conversation_id.or(fallback)) else {
                    debug!("Dropping message {} without a conversation", message.id);
                    return;
                };
                self.merge_messages(&conversation_id, vec![message], MergeSource::Live).await;
            }
            InboundEvent::SyncResponse { conversation_id, messages, events } => {
                let fallback = messages.iter().find_map(|m| m.conversation_id.clone());
                let Some(conversation_id) = self.resolve_conversation(conversation_id.or(fallback)) else {
                    debug!("Dropping sync response without a conversation");
                    return;
                };
                let new_events = lock(&self.engine).merge_events(&conversation_id, events);
                if new_events > 0 {
                    self.notify(SyncNotification::ConversationUpdated {
                        conversation_id: conversation_id.clone(),
                    });
                }
                self.merge_messages(&conversation_id, messages, MergeSource::Sync).await;
            }
            InboundEvent::MessageAck { msg_id, client_msg_id } => {
                if lock(&self.engine).acknowledge(&client_msg_id, &msg_id) {
                    self.notify(SyncNotification::SendAcknowledged { client_msg_id, msg_id });
                } else {
                    debug!("Ack for unknown client message {client_msg_id}");
                }
            }
            InboundEvent::Session(session) => {
                info!("Session {} negotiated", session.session_id);
                self.connection.set_session(&session);
                self.local.save_session(&session).await;
            }
            InboundEvent::AgentStatus(status) => {
                *lock(&self.agent_status) = Some(status.clone());
                self.notify(SyncNotification::AgentStatus(status));
            }
            InboundEvent::ConversationEvent { conversation_id, event } => {
                if lock(&self.engine).apply_conversation_event(&conversation_id, event) {
                    self.notify(SyncNotification::ConversationUpdated { conversation_id });
                    self.request_inbox_refresh();
                }
            }
            InboundEvent::Typing { conversation_id, sender, is_typing } => {
                if !self.config.role.is_remote(&sender) {
                    return;
                }
                if self.peer_typing.update(&conversation_id, is_typing) {
                    self.notify(SyncNotification::PeerTyping { conversation_id, is_typing });
                }
            }
            InboundEvent::Read { conversation_id, sender, last_read_msg_id, read_at } => {
                if self.config.role.is_own(&sender) {
                    // Read on another device of ours.
                    lock(&self.engine).mark_read(&conversation_id);
                    lock(&self.receipts).restore(&conversation_id, &last_read_msg_id);
                    self.notify(SyncNotification::ConversationUpdated { conversation_id });
                } else if self.config.role.is_remote(&sender) {
                    lock(&self.peer_reads).insert(
                        conversation_id.clone(),
                        PeerRead { last_read_msg_id: last_read_msg_id.clone(), read_at },
                    );
                    self.notify(SyncNotification::PeerRead { conversation_id, last_read_msg_id });
                }
            }
            InboundEvent::Error(frame) => self.on_error_frame(frame).await,
            InboundEvent::Pong | InboundEvent::Unrecognized => {}
        }
    }

    fn resolve_conversation(&self, explicit: Option<String>) -> Option<String> {
        explicit.or_else(|| lock(&self.engine).active().map(str::to_string))
    }

    async fn merge_messages(self: &Arc<Self>, conversation_id: &str, batch: Vec<Message>, source: MergeSource) {
        let outcome = lock(&self.engine).merge_messages(conversation_id, batch, source);
        if outcome.inserted == 0 {
            return;
        }
        self.notify(SyncNotification::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
        if outcome.new_conversation {
            self.request_inbox_refresh();
        }
        self.evaluate_receipt(conversation_id).await;
    }

    async fn on_error_frame(&self, frame: ErrorFrame) {
        if !frame.is_auth_failure() {
            warn!("Server error {}: {} (rid {:?})", frame.code, frame.message, frame.rid);
            return;
        }
        let rejected = AppError::AuthRejected { code: frame.code.clone(), message: frame.message.clone() };
        error!("{rejected}");
        self.typing.cancel();
        self.connection.close();
        self.local.clear_session().await;
        self.notify(SyncNotification::AuthRevoked { code: frame.code, message: frame.message });
    }

    /// Runs once per transport after the subscription replay.
    async fn on_ready(&self) {
        let active = lock(&self.engine).active().map(str::to_string);
        if let Some(conversation_id) = active {
            self.request_sync(&conversation_id);
            self.evaluate_receipt(&conversation_id).await;
        }
    }

    fn apply_sibling_read(&self, envelope: ReadEnvelope) {
        lock(&self.engine).mark_read(&envelope.conversation_id);
        lock(&self.receipts).restore(&envelope.conversation_id, &envelope.last_read_msg_id);
        self.notify(SyncNotification::ConversationUpdated {
            conversation_id: envelope.conversation_id,
        });
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    fn request_sync(&self, conversation_id: &str) {
        let after_msg_id = lock(&self.engine).last_message_id(conversation_id).map(str::to_string);
        self.connection.send(OutboundFrame::Sync {
            conversation_id: conversation_id.to_string(),
            after_msg_id,
        });
    }

    fn enqueue(&self, conversation_id: &str, content: MessageContent) -> PendingSend {
        let pending = PendingSend::new(conversation_id, content);
        lock(&self.engine).add_pending(pending.clone());
        let frame = OutboundFrame::send_message(conversation_id, &pending.client_msg_id, &pending.content);
        if !self.connection.send(frame) {
            debug!("Message {} kept pending: not connected", pending.client_msg_id);
        }
        pending
    }

    async fn on_visibility_change(&self, became_visible: bool) {
        if !became_visible {
            return;
        }
        let active = lock(&self.engine).active().map(str::to_string);
        if let Some(conversation_id) = active {
            self.evaluate_receipt(&conversation_id).await;
        }
    }

    /// Sends a read receipt for the active conversation if one is owed.
    ///
    /// The watermark is reserved before the frame goes out and released again
    /// if no live transport took it, so the next `Ready` re-sends it. Only a
    /// delivered watermark is persisted and announced to sibling contexts.
    async fn evaluate_receipt(&self, conversation_id: &str) {
        let Some((frame, msg_id, previous)) = self.reserve_receipt(conversation_id) else {
            return;
        };
        if !self.connection.deliver(frame).await {
            debug!("Read receipt for {conversation_id} not delivered, will retry on reconnect");
            lock(&self.receipts).release(conversation_id, &msg_id, previous.as_deref());
            return;
        }
        debug!("Marked {conversation_id} read up to {msg_id}");
        self.local.save_read_watermark(conversation_id, &msg_id).await;
        self.broadcast.publish(conversation_id, &msg_id).await;
    }

    fn reserve_receipt(&self, conversation_id: &str) -> Option<(OutboundFrame, String, Option<String>)> {
        let engine = lock(&self.engine);
        if !engine.is_active(conversation_id) {
            return None;
        }
        let mut receipts = lock(&self.receipts);
        let frame = receipts.evaluate(conversation_id, engine.messages(conversation_id))?;
        let OutboundFrame::MsgRead { last_read_msg_id, .. } = &frame else {
            return None;
        };
        let msg_id = last_read_msg_id.clone();
        let previous = receipts.last_sent(conversation_id).map(str::to_string);
        receipts.record_sent(conversation_id, &msg_id);
        Some((frame, msg_id, previous))
    }

    // ── Inbox ────────────────────────────────────────────────────────────────

    async fn refresh_inbox(&self) -> Result<(), AppError> {
        let summaries = self.remote.conversations().await?;
        lock(&self.engine).apply_inbox(summaries);
        self.notify(SyncNotification::InboxChanged);
        Ok(())
    }

    fn request_inbox_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.remote.schedule_refresh(move || {
            let Some(inner) = weak.upgrade() else { return };
            tokio::spawn(async move {
                if let Err(e) = inner.refresh_inbox().await {
                    warn!("Inbox refresh failed: {e}");
                }
            });
        });
    }

    fn notify(&self, notification: SyncNotification) {
        // Nobody listening is fine.
        let _ = self.notifications.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionInfo;
    use crate::test_support::{mock_connector, MockConnector, MockServer};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    type Servers = mpsc::UnboundedReceiver<MockServer>;

    async fn spawn_service_with(
        role: ClientRole,
        shared: SharedContexts,
        backend: Option<Arc<dyn ChatBackend>>,
    ) -> (SyncService, Arc<MockConnector>, Servers) {
        let (connector, servers) = mock_connector();
        let deps = SyncDeps { connector: connector.clone(), shared, backend };
        let mut config = SyncConfig::new(role, "ws://chat.test/ws", "tok");
        config.site_id = Some("site-1".into());
        let service = SyncService::start(config, deps).await.unwrap();
        (service, connector, servers)
    }

    async fn spawn_service(role: ClientRole) -> (SyncService, Arc<MockConnector>, Servers) {
        spawn_service_with(role, SharedContexts::new(Arc::new(MemoryStore::new())), None).await
    }

    /// Lets every runnable task finish; paused time only advances when idle.
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    /// Past the auth settle delay, so the connection has reported `Ready`.
    async fn until_ready() {
        sleep(Duration::from_millis(250)).await;
    }

    fn push_msg(server: &MockServer, conversation_id: &str, id: &str, sender: &str, created_at: i64) {
        server.push(json!({
            "type": "MSG",
            "conversation_id": conversation_id,
            "msg": {
                "id": id,
                "sender_type": sender,
                "content_type": "text",
                "content": format!("text {id}"),
                "created_at": created_at
            }
        }));
    }

    fn kinds(frames: &[Value]) -> Vec<&str> {
        frames.iter().filter_map(|f| f["type"].as_str()).collect()
    }

    /// Connects and consumes AUTH and the SUB replay.
    async fn open(service: &SyncService, servers: &mut Servers, subs: usize) -> MockServer {
        service.connect();
        let mut server = servers.recv().await.unwrap();
        assert_eq!(server.next_frame().await["type"], "AUTH");
        for _ in 0..subs {
            assert_eq!(server.next_frame().await["type"], "SUB");
        }
        until_ready().await;
        server
    }

    #[tokio::test(start_paused = true)]
    async fn live_messages_drive_unread_and_receipts() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Agent).await;
        service.select_conversation("c1").await;
        let mut server = open(&service, &mut servers, 1).await;
        assert_eq!(
            server.next_frame().await,
            json!({"type": "SYNC", "conversation_id": "c1", "after_msg_id": null})
        );

        push_msg(&server, "c1", "m1", "customer", 10);
        settle().await;
        assert_eq!(
            server.next_frame().await,
            json!({"type": "MSG_READ", "conversation_id": "c1", "last_read_msg_id": "m1"})
        );

        // Replayed push: no second receipt.
        push_msg(&server, "c1", "m1", "customer", 10);
        push_msg(&server, "c2", "m2", "customer", 20);
        settle().await;
        assert!(server.drain().is_empty());
        assert_eq!(service.summary("c1").unwrap().unread_count, 0);
        assert_eq!(service.summary("c2").unwrap().unread_count, 1);
        assert_eq!(service.summaries()[0].id, "c2");

        service.select_conversation("c2").await;
        assert_eq!(service.summary("c2").unwrap().unread_count, 0);
        settle().await;
        let frames = server.drain();
        assert_eq!(kinds(&frames), ["SUB", "SYNC", "MSG_READ"]);
        assert_eq!(frames[2]["last_read_msg_id"], "m2");
        assert_eq!(service.read_watermark("c2").as_deref(), Some("m2"));
    }

    #[tokio::test(start_paused = true)]
    async fn messages_sent_offline_stay_pending_until_retried() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Visitor).await;
        let pending = service.send_text("c1", "  hello  ").await.unwrap();
        assert_eq!(pending.content, MessageContent::Text("hello".into()));
        assert_eq!(service.pending("c1").len(), 1);

        let mut server = open(&service, &mut servers, 0).await;
        sleep(Duration::from_secs(1)).await;
        assert!(kinds(&server.drain()).iter().all(|k| *k != "MSG_SEND"));

        assert!(service.retry_send(&pending.client_msg_id).unwrap());
        let frame = server.next_frame().await;
        assert_eq!(frame["type"], "MSG_SEND");
        assert_eq!(frame["client_msg_id"], pending.client_msg_id.as_str());
        assert_eq!(frame["content"], "hello");

        server.push(json!({"type": "MSG_ACK", "msg_id": "srv-1", "client_msg_id": pending.client_msg_id}));
        push_msg(&server, "c1", "srv-1", "customer", 5);
        settle().await;
        assert!(service.pending("c1").is_empty());
        assert_eq!(service.messages("c1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_and_identity_survive_a_restart() {
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let (first, _connector, _servers) =
            spawn_service_with(ClientRole::Visitor, shared.clone(), None).await;
        first.select_conversation("c7").await;
        first.update_draft("c7", "half a thought").await;
        first
            .save_visitor_identity(&VisitorIdentity { name: "Ada".into(), email: "ada@example.com".into() })
            .await
            .unwrap();
        let err = first
            .save_visitor_identity(&VisitorIdentity { name: " ".into(), email: "x@example.com".into() })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        first.shutdown();

        let (second, _connector, _servers) = spawn_service_with(ClientRole::Visitor, shared, None).await;
        assert_eq!(second.active_conversation(), None);
        assert_eq!(second.restore_selection().await.as_deref(), Some("c7"));
        assert_eq!(second.active_conversation().as_deref(), Some("c7"));
        assert_eq!(second.draft("c7").as_deref(), Some("half a thought"));
        assert_eq!(second.visitor_identity().await.map(|v| v.name).as_deref(), Some("Ada"));
    }

    #[tokio::test(start_paused = true)]
    async fn visitor_without_a_configured_site_reuses_the_persisted_one() {
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let (first, _connector, _servers) =
            spawn_service_with(ClientRole::Visitor, shared.clone(), None).await;
        first.shutdown();
        LocalState::new(shared.store(), ClientRole::Visitor, Some("site-1".into()))
            .save_read_watermark("c1", "m5")
            .await;

        let (connector, _servers) = mock_connector();
        let config = SyncConfig::new(ClientRole::Visitor, "ws://chat.test/ws", "tok");
        let service = SyncService::start(config, SyncDeps { connector, shared, backend: None })
            .await
            .unwrap();
        service.select_conversation("c1").await;
        assert_eq!(service.read_watermark("c1").as_deref(), Some("m5"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_messages_are_rejected() {
        let (service, _connector, _servers) = spawn_service(ClientRole::Visitor).await;
        let err = service.send_text("c1", "   ").await.unwrap_err();
        assert!(err.is_validation());
        let err = service.send_text("c1", &"x".repeat(MAX_MESSAGE_LENGTH + 1)).await.unwrap_err();
        assert!(matches!(err, AppError::FieldTooLong { actual_length: 8001, .. }));
        assert!(service.pending("c1").is_empty());
        assert!(matches!(
            service.retry_send("nope"),
            Err(AppError::PendingNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_closes_for_good_and_forgets_the_session() {
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let local = LocalState::new(shared.store(), ClientRole::Agent, None);
        local
            .save_session(&SessionInfo {
                session_id: "old".into(),
                heartbeat_interval_seconds: 25,
                heartbeat_ttl_seconds: None,
            })
            .await;

        let (service, connector, mut servers) = spawn_service_with(ClientRole::Agent, shared, None).await;
        let mut notifications = service.notifications();
        service.connect();
        let mut server = servers.recv().await.unwrap();
        assert_eq!(server.next_frame().await["session_id"], "old");

        server.push(json!({"type": "ERROR", "code": "TOKEN_EXPIRED", "message": "expired"}));
        settle().await;
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
        assert_eq!(local.session().await, None);

        let mut revoked = false;
        while let Ok(notification) = notifications.try_recv() {
            revoked |= matches!(notification, SyncNotification::AuthRevoked { ref code, .. } if code == "TOKEN_EXPIRED");
        }
        assert!(revoked);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_times().len(), 1);
        assert!(servers.try_recv().is_err());

        service.reauthenticate("tok-2");
        let mut next = servers.recv().await.unwrap();
        assert_eq!(next.next_frame().await, json!({"type": "AUTH", "token": "tok-2", "client": "agent"}));
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_only_logged() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Agent).await;
        let server = open(&service, &mut servers, 0).await;
        server.push(json!({"type": "ERROR", "code": "RATE_LIMITED", "message": "slow down"}));
        settle().await;
        assert_eq!(service.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn sibling_context_adopts_read_state() {
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let (reader, _c1, mut reader_servers) = spawn_service_with(ClientRole::Agent, shared.clone(), None).await;
        let (sibling, _c2, mut sibling_servers) = spawn_service_with(ClientRole::Agent, shared, None).await;

        reader.select_conversation("c1").await;
        let mut reader_server = open(&reader, &mut reader_servers, 1).await;
        let mut sibling_server = open(&sibling, &mut sibling_servers, 0).await;
        reader_server.drain();

        push_msg(&sibling_server, "c1", "m1", "customer", 10);
        settle().await;
        assert_eq!(sibling.summary("c1").unwrap().unread_count, 1);

        push_msg(&reader_server, "c1", "m1", "customer", 10);
        settle().await;
        assert_eq!(kinds(&reader_server.drain()), ["MSG_READ"]);
        assert_eq!(sibling.summary("c1").unwrap().unread_count, 0);
        assert_eq!(sibling.read_watermark("c1").as_deref(), Some("m1"));

        sibling.select_conversation("c1").await;
        settle().await;
        assert_eq!(kinds(&sibling_server.drain()), ["SUB", "SYNC"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_catches_up_from_the_last_message() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Agent).await;
        service.select_conversation("c1").await;
        let mut server = open(&service, &mut servers, 1).await;
        server.drain();
        push_msg(&server, "c1", "m1", "customer", 10);
        settle().await;
        server.drain();

        server.hang_up();
        let mut server = servers.recv().await.unwrap();
        assert_eq!(server.next_frame().await["type"], "AUTH");
        assert_eq!(server.next_frame().await, json!({"type": "SUB", "conversation_id": "c1"}));
        assert_eq!(
            server.next_frame().await,
            json!({"type": "SYNC", "conversation_id": "c1", "after_msg_id": "m1"})
        );
        settle().await;
        assert!(server.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_resend_a_persisted_receipt() {
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let local = LocalState::new(shared.store(), ClientRole::Agent, None);
        local.save_read_watermark("c1", "m1").await;

        let (service, _connector, mut servers) = spawn_service_with(ClientRole::Agent, shared, None).await;
        service.select_conversation("c1").await;
        let mut server = open(&service, &mut servers, 1).await;
        server.drain();
        push_msg(&server, "c1", "m1", "customer", 10);
        settle().await;
        assert!(server.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_visitor_reads_once_visible() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Visitor).await;
        service.set_host_visibility(Some(false)).await;
        service.select_conversation("c1").await;
        let mut server = open(&service, &mut servers, 1).await;
        server.drain();

        push_msg(&server, "c1", "m1", "agent", 10);
        settle().await;
        assert!(server.drain().is_empty());

        service.set_host_visibility(Some(true)).await;
        assert_eq!(
            server.next_frame().await,
            json!({"type": "MSG_READ", "conversation_id": "c1", "last_read_msg_id": "m1"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_lost_with_the_transport_goes_out_after_reconnect() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Visitor).await;
        service.set_host_visibility(Some(false)).await;
        service.select_conversation("c1").await;
        let mut server = open(&service, &mut servers, 1).await;
        push_msg(&server, "c1", "m1", "agent", 10);
        settle().await;
        server.drain();

        server.hang_up();
        service.set_host_visibility(Some(true)).await;
        assert_eq!(service.read_watermark("c1"), None);
        assert!(server.drain().iter().all(|f| f["type"] != "MSG_READ"));

        let mut next = servers.recv().await.unwrap();
        assert_eq!(next.next_frame().await["type"], "AUTH");
        assert_eq!(next.next_frame().await["type"], "SUB");
        assert_eq!(next.next_frame().await["type"], "SYNC");
        assert_eq!(
            next.next_frame().await,
            json!({"type": "MSG_READ", "conversation_id": "c1", "last_read_msg_id": "m1"})
        );
        settle().await;
        assert_eq!(service.read_watermark("c1").as_deref(), Some("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn presence_frames_update_peer_state() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Visitor).await;
        let server = open(&service, &mut servers, 0).await;

        server.push(json!({"type": "TYPING", "conversation_id": "c1", "sender_role": "visitor", "is_typing": true}));
        settle().await;
        assert!(!service.is_peer_typing("c1"));

        server.push(json!({"type": "TYPING", "conversation_id": "c1", "sender_role": "agent", "is_typing": true}));
        settle().await;
        assert!(service.is_peer_typing("c1"));
        sleep(Duration::from_secs(7)).await;
        assert!(!service.is_peer_typing("c1"));

        server.push(json!({
            "type": "READ", "conversation_id": "c1", "sender_role": "agent",
            "last_read_msg_id": "m4", "read_at": 1700000000
        }));
        server.push(json!({"type": "SESSION", "session_id": "s-9", "heartbeat_interval_seconds": 30}));
        settle().await;
        assert_eq!(service.peer_read("c1").unwrap().last_read_msg_id, "m4");
    }

    #[tokio::test(start_paused = true)]
    async fn drafts_drive_typing_and_persist() {
        let (service, _connector, mut servers) = spawn_service(ClientRole::Visitor).await;
        let mut server = open(&service, &mut servers, 0).await;

        service.update_draft("c1", "hel").await;
        assert_eq!(
            server.next_frame().await,
            json!({"type": "TYPING", "conversation_id": "c1", "is_typing": true})
        );
        assert_eq!(service.draft("c1").as_deref(), Some("hel"));

        service.send_text("c1", "hello").await.unwrap();
        settle().await;
        assert_eq!(kinds(&server.drain()), ["MSG_SEND", "TYPING"]);
        assert_eq!(service.draft("c1"), None);
    }

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for CountingBackend {
        async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut summary = ConversationSummary::new("c9");
            summary.unread_count = 2;
            summary.last_message_created_at = Some(99);
            Ok(vec![summary])
        }

        async fn fetch_history(
            &self,
            conversation_id: &str,
            _before: Option<&str>,
        ) -> Result<Vec<Message>, AppError> {
            Ok(vec![Message {
                id: "h1".into(),
                conversation_id: Some(conversation_id.to_string()),
                sender_type: crate::models::SenderType::Customer,
                sender_id: None,
                content: MessageContent::Text("old".into()),
                created_at: 1,
                preview: None,
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn inbox_refreshes_are_coalesced() {
        let backend = Arc::new(CountingBackend { calls: AtomicUsize::new(0) });
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let (service, _connector, mut servers) =
            spawn_service_with(ClientRole::Agent, shared, Some(backend.clone() as Arc<dyn ChatBackend>)).await;
        let server = open(&service, &mut servers, 0).await;

        service.request_inbox_refresh();
        push_msg(&server, "c3", "m1", "customer", 10);
        server.push(json!({
            "type": "CONV_EVENT", "conversation_id": "c3", "event_id": "e1",
            "event_key": "archived", "created_at": 11, "data": {}
        }));
        settle().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.summary("c9").unwrap().unread_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn history_pages_never_count_as_unread() {
        let backend = Arc::new(CountingBackend { calls: AtomicUsize::new(0) });
        let shared = SharedContexts::new(Arc::new(MemoryStore::new()));
        let (service, _connector, _servers) = spawn_service_with(ClientRole::Agent, shared, Some(backend as Arc<dyn ChatBackend>)).await;

        assert_eq!(service.load_history("c1", None).await.unwrap(), 1);
        assert_eq!(service.load_older("c1").await.unwrap(), 0);
        assert_eq!(service.summary("c1").unwrap().unread_count, 0);

        let (bare, _connector, _servers) = spawn_service(ClientRole::Agent).await;
        assert!(matches!(
            bare.load_history("c1", None).await,
            Err(AppError::BackendUnavailable { .. })
        ));
    }
}
