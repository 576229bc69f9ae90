use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use livechat_sync::api::{ChatApi, ChatBackend};
use livechat_sync::broadcast::SharedContexts;
use livechat_sync::connection::WsConnector;
use livechat_sync::db::{KeyValueStore, MemoryStore, SqliteStore};
use livechat_sync::models::{Message, MessageContent};
use livechat_sync::{SyncConfig, SyncDeps, SyncNotification, SyncRegistry, SyncService};

/// Tails the conversations named on the command line; the first one is
/// selected, so it is kept read.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livechat_sync=debug".into()),
        )
        .init();

    let config = SyncConfig::from_env()?;
    let conversations: Vec<String> = std::env::args().skip(1).collect();

    // ── Local state ───────────────────────────────────────────────────────────
    let store: Arc<dyn KeyValueStore> = match &config.state_db {
        Some(url) => Arc::new(SqliteStore::connect(url).await?),
        None => {
            info!("LIVECHAT_STATE_DB not set, keeping local state in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let backend: Option<Arc<dyn ChatBackend>> = config
        .api_base
        .as_ref()
        .map(|base| Arc::new(ChatApi::new(base.clone(), Some(config.token.clone()))) as Arc<dyn ChatBackend>);
    let deps = SyncDeps {
        connector: Arc::new(WsConnector::new(config.ws_url.clone())),
        shared: SharedContexts::new(store),
        backend,
    };

    let registry = SyncRegistry::new();
    let role = config.role;
    let service = registry.init(config, deps).await?;
    let notifications = service.notifications();
    service.connect();

    if let Err(e) = service.refresh_inbox().await {
        warn!("Initial inbox refresh skipped: {e}");
    }
    let active = match conversations.split_first() {
        Some((active, rest)) => {
            service.set_subscriptions(rest.iter().cloned());
            service.select_conversation(active).await;
            Some(active.clone())
        }
        None => service.restore_selection().await,
    };
    if let Some(active) = active {
        if let Err(e) = service.load_history(&active, None).await {
            warn!("Could not load history for {active}: {e}");
        }
    }

    // ── Tail ──────────────────────────────────────────────────────────────────
    tokio::select! {
        _ = tail(service.clone(), notifications) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    registry.shutdown(role).await;
    Ok(())
}

async fn tail(service: SyncService, mut notifications: tokio::sync::broadcast::Receiver<SyncNotification>) {
    let mut printed: HashSet<String> = HashSet::new();
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Display fell behind by {skipped} notification(s)");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match notification {
            SyncNotification::ConversationUpdated { conversation_id } => {
                for message in service.messages(&conversation_id) {
                    if printed.insert(message.id.clone()) {
                        println!("{}", render(&conversation_id, &message));
                    }
                }
            }
            SyncNotification::PeerTyping { conversation_id, is_typing: true } => {
                println!("[{conversation_id}] ...typing");
            }
            SyncNotification::AuthRevoked { code, message } => {
                println!("Credential rejected ({code}): {message}");
                return;
            }
            SyncNotification::Connection(state) => info!("Connection {state:?}"),
            other => debug!("{other:?}"),
        }
    }
}

fn render(conversation_id: &str, message: &Message) -> String {
    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::File(file) => format!("<file {}>", file.filename),
    };
    format!("[{conversation_id}] {:?}: {body}", message.sender_type)
}
