use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::{Backoff, ConnectionSettings};
use crate::errors::AppError;
use crate::models::ClientRole;
use crate::presence::{DEFAULT_PEER_TYPING_TTL, DEFAULT_TYPING_IDLE};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_AUTH_SETTLE: Duration = Duration::from_millis(200);
pub const DEFAULT_INBOX_REFRESH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Everything one client context needs to run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub role: ClientRole,
    pub ws_url: String,
    pub api_base: Option<String>,
    pub token: String,
    pub site_id: Option<String>,
    pub heartbeat_interval: Duration,
    pub auth_settle: Duration,
    pub backoff: Backoff,
    pub typing_idle: Duration,
    pub peer_typing_ttl: Duration,
    pub inbox_refresh_debounce: Duration,
    /// `None` keeps local state in memory only.
    pub state_db: Option<String>,
}

impl SyncConfig {
    pub fn new(role: ClientRole, ws_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            role,
            ws_url: ws_url.into(),
            api_base: None,
            token: token.into(),
            site_id: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            auth_settle: DEFAULT_AUTH_SETTLE,
            backoff: Backoff::default(),
            typing_idle: DEFAULT_TYPING_IDLE,
            peer_typing_ttl: DEFAULT_PEER_TYPING_TTL,
            inbox_refresh_debounce: DEFAULT_INBOX_REFRESH_DEBOUNCE,
            state_db: None,
        }
    }

    /// Reads `LIVECHAT_*` variables. Call `dotenvy::dotenv()` first to pick up
    /// a `.env` file.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::MissingConfig { key: key.to_string() })
        };

        let role = match lookup("LIVECHAT_ROLE") {
            Some(raw) => ClientRole::try_from(raw.clone())
                .map_err(|_| AppError::InvalidConfig { key: "LIVECHAT_ROLE".into(), value: raw })?,
            None => ClientRole::Agent,
        };

        let mut config = Self::new(role, required("LIVECHAT_WS_URL")?, required("LIVECHAT_TOKEN")?);
        config.api_base = lookup("LIVECHAT_API_BASE");
        config.site_id = lookup("LIVECHAT_SITE_ID");
        config.state_db = lookup("LIVECHAT_STATE_DB");

        if let Some(secs) = parse::<u64>(&lookup, "LIVECHAT_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "LIVECHAT_AUTH_SETTLE_MS")? {
            config.auth_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "LIVECHAT_TYPING_IDLE_MS")? {
            config.typing_idle = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn connection_settings(&self, session_id: Option<String>) -> ConnectionSettings {
        ConnectionSettings {
            role: self.role,
            token: self.token.clone(),
            session_id,
            heartbeat_interval: self.heartbeat_interval,
            auth_settle: self.auth_settle,
            backoff: self.backoff,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::InvalidConfig { key: key.to_string(), value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("LIVECHAT_WS_URL", "wss://chat.example/ws"),
            ("LIVECHAT_TOKEN", "tok"),
        ]))
        .unwrap();
        assert_eq!(config.role, ClientRole::Agent);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.auth_settle, Duration::from_millis(200));
        assert_eq!(config.typing_idle, Duration::from_millis(1200));
        assert_eq!(config.state_db, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("LIVECHAT_WS_URL", "ws://localhost:3000/ws"),
            ("LIVECHAT_TOKEN", "tok"),
            ("LIVECHAT_ROLE", "visitor"),
            ("LIVECHAT_SITE_ID", "site-9"),
            ("LIVECHAT_HEARTBEAT_SECS", "40"),
            ("LIVECHAT_AUTH_SETTLE_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.role, ClientRole::Visitor);
        assert_eq!(config.site_id.as_deref(), Some("site-9"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(40));
        assert_eq!(config.auth_settle, Duration::ZERO);
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        let err = SyncConfig::from_lookup(lookup(&[("LIVECHAT_TOKEN", "tok")])).unwrap_err();
        assert!(matches!(err, AppError::MissingConfig { ref key } if key == "LIVECHAT_WS_URL"));

        let err = SyncConfig::from_lookup(lookup(&[
            ("LIVECHAT_WS_URL", "ws://x"),
            ("LIVECHAT_TOKEN", "tok"),
            ("LIVECHAT_HEARTBEAT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig { ref key, .. } if key == "LIVECHAT_HEARTBEAT_SECS"));

        let err = SyncConfig::from_lookup(lookup(&[
            ("LIVECHAT_WS_URL", "ws://x"),
            ("LIVECHAT_TOKEN", "tok"),
            ("LIVECHAT_ROLE", "admin"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig { ref key, .. } if key == "LIVECHAT_ROLE"));
    }
}
