use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::info;

use super::sync_service::{SyncDeps, SyncService};
use crate::config::SyncConfig;
use crate::errors::AppError;
use crate::models::ClientRole;

/// At most one live context per role, created on first use and kept until
/// shut down explicitly.
#[derive(Default)]
pub struct SyncRegistry {
    services: Mutex<HashMap<ClientRole, SyncService>>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the context for `config.role`, starting it if needed. A second
    /// call for the same role returns the existing context and ignores its
    /// arguments.
    pub async fn init(&self, config: SyncConfig, deps: SyncDeps) -> Result<SyncService, AppError> {
        let mut services = self.services.lock().await;
        if let Some(existing) = services.get(&config.role) {
            return Ok(existing.clone());
        }
        let role = config.role;
        let service = SyncService::start(config, deps).await?;
        services.insert(role, service.clone());
        info!("Registered sync service for {role}");
        Ok(service)
    }

    pub async fn get(&self, role: ClientRole) -> Option<SyncService> {
        self.services.lock().await.get(&role).cloned()
    }

    /// Shuts down and forgets the context for `role`. Returns whether one existed.
    pub async fn shutdown(&self, role: ClientRole) -> bool {
        let removed = self.services.lock().await.remove(&role);
        match removed {
            Some(service) => {
                service.shutdown();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let services: Vec<SyncService> = self.services.lock().await.drain().map(|(_, s)| s).collect();
        for service in services {
            service.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mock_connector;

    fn config(role: ClientRole) -> SyncConfig {
        SyncConfig::new(role, "ws://chat.test/ws", "tok")
    }

    #[tokio::test(start_paused = true)]
    async fn one_context_per_role() {
        let registry = SyncRegistry::new();
        let (connector, _servers) = mock_connector();
        let deps = SyncDeps::in_memory(connector);

        let first = registry.init(config(ClientRole::Agent), deps.clone()).await.unwrap();
        first.update_draft("c1", "kept").await;
        let second = registry.init(config(ClientRole::Agent), deps.clone()).await.unwrap();
        assert_eq!(second.draft("c1").as_deref(), Some("kept"));

        let visitor = registry.init(config(ClientRole::Visitor), deps).await.unwrap();
        assert_eq!(visitor.role(), ClientRole::Visitor);
        assert_eq!(visitor.draft("c1"), None);
        assert!(registry.get(ClientRole::Agent).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forgets_the_context() {
        let registry = SyncRegistry::new();
        let (connector, _servers) = mock_connector();
        registry
            .init(config(ClientRole::Agent), SyncDeps::in_memory(connector))
            .await
            .unwrap();

        assert!(registry.shutdown(ClientRole::Agent).await);
        assert!(!registry.shutdown(ClientRole::Agent).await);
        assert!(registry.get(ClientRole::Agent).await.is_none());
        registry.shutdown_all().await;
    }
}
