use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::ChatBackend;
use crate::errors::AppError;
use crate::lock;
use crate::models::{ConversationSummary, Message};
use crate::timer::ScheduledTask;

/// The optional HTTP collaborator of a context and the timer that coalesces
/// inbox refreshes into one fetch.
pub(crate) struct Remote {
    backend: Option<Arc<dyn ChatBackend>>,
    debounce: Duration,
    refresh: Mutex<ScheduledTask>,
}

impl Remote {
    pub fn new(backend: Option<Arc<dyn ChatBackend>>, debounce: Duration) -> Self {
        Self { backend, debounce, refresh: Mutex::new(ScheduledTask::new()) }
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, AppError> {
        self.backend("refresh_inbox")?.fetch_conversations().await
    }

    pub async fn history(
        &self,
        conversation_id: &str,
        before: Option<&str>,
    ) -> Result<Vec<Message>, AppError> {
        self.backend("load_history")?.fetch_history(conversation_id, before).await
    }

    /// Runs `refresh` once requests have been quiet for the debounce period.
    /// Without a backend there is nothing to refresh and `refresh` is dropped.
    pub fn schedule_refresh(&self, refresh: impl FnOnce() + Send + 'static) {
        if self.backend.is_none() {
            return;
        }
        lock(&self.refresh).start(self.debounce, refresh);
    }

    pub fn cancel(&self) {
        lock(&self.refresh).cancel();
    }

    fn backend(&self, operation: &str) -> Result<&Arc<dyn ChatBackend>, AppError> {
        self.backend
            .as_ref()
            .ok_or_else(|| AppError::BackendUnavailable { operation: operation.to_string() })
    }
}
