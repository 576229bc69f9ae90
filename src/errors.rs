use thiserror::Error;

/// Top-level error for the sync layer.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Transport errors ─────────────────────────────────────────────────────
    #[error("Failed to open transport to {url}: {source}")]
    TransportConnect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    // ── Auth errors ──────────────────────────────────────────────────────────
    #[error("Server rejected credentials ({code}): {message}")]
    AuthRejected { code: String, message: String },

    // ── Protocol errors ──────────────────────────────────────────────────────
    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    // ── Ancillary HTTP errors ────────────────────────────────────────────────
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server returned {status} for {url}")]
    ServerStatus { url: String, status: u16 },

    #[error("No chat backend configured for {operation}")]
    BackendUnavailable { operation: String },

    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("Storage operation failed: {message}")]
    Storage {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Storage migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    // ── Configuration errors ─────────────────────────────────────────────────
    #[error("Missing configuration value '{key}'")]
    MissingConfig { key: String },

    #[error("Invalid configuration value for '{key}': {value}")]
    InvalidConfig { key: String, value: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Lookup errors ────────────────────────────────────────────────────────
    #[error("No pending send with client id '{client_msg_id}'")]
    PendingNotFound { client_msg_id: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn storage(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::Storage { message: message.into(), source }
    }

    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        AppError::Http { url: url.into(), source }
    }

    pub fn decode(what: impl Into<String>, source: serde_json::Error) -> Self {
        AppError::Decode { what: what.into(), source }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AppError::AuthRejected { .. })
            || matches!(self, AppError::ServerStatus { status: 401 | 403, .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    /// Failures the connection manager recovers from by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransportConnect { .. } | AppError::TransportClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        let auth = AppError::AuthRejected {
            code: "TOKEN_EXPIRED".into(),
            message: "expired".into(),
        };
        assert!(auth.is_auth_failure());
        assert!(!auth.is_transient());

        let forbidden = AppError::ServerStatus { url: "/session".into(), status: 403 };
        assert!(forbidden.is_auth_failure());

        let closed = AppError::TransportClosed("reset by peer".into());
        assert!(closed.is_transient());

        let empty = AppError::EmptyField { field_name: "message".into() };
        assert!(empty.is_validation());
        assert_eq!(empty.to_string(), "Field 'message' cannot be empty");
    }
}
