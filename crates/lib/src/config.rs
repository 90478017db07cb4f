//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.support-relay/config.json`);
//! secrets can be overridden from the environment so tokens stay out of the
//! file when preferred.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Telegram bot settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Relay behaviour (operator group, timeouts).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Sqlite storage location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Message history (audit log) settings.
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Telegram bot config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
}

/// Relay settings: where operator topics live and how long platform calls may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Chat id of the forum-enabled operator group. Overridden by
    /// OPERATOR_GROUP_ID env when set.
    pub operator_group_id: Option<i64>,

    /// Bound on each outbound platform call, in seconds (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            operator_group_id: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Storage location config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Sqlite database path (default ~/.support-relay/relay.sqlite3).
    pub db_path: Option<PathBuf>,
}

/// History (message audit log) config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// When false, relayed messages are not recorded (default true).
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_history_enabled(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_history_enabled() -> bool {
    true
}

/// Resolve the bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_bot_token(config: &Config) -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .telegram
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the operator group id: env OPERATOR_GROUP_ID overrides config.
pub fn resolve_operator_group_id(config: &Config) -> Option<i64> {
    std::env::var("OPERATOR_GROUP_ID")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .or(config.relay.operator_group_id)
}

/// Resolve the sqlite path: config override or ~/.support-relay/relay.sqlite3.
pub fn resolve_db_path(config: &Config) -> PathBuf {
    config.storage.db_path.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(".support-relay").join("relay.sqlite3"))
            .unwrap_or_else(|| PathBuf::from("relay.sqlite3"))
    })
}

/// Bound on each outbound platform call.
pub fn request_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.relay.request_timeout_secs.max(1))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SUPPORT_RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".support-relay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or SUPPORT_RELAY_CONFIG_PATH). Missing
/// file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.relay.request_timeout_secs, 30);
        assert!(c.history.enabled);
        assert!(c.telegram.bot_token.is_none());
        assert!(c.relay.operator_group_id.is_none());
    }

    #[test]
    fn parse_full_config() {
        let c: Config = serde_json::from_str(
            r#"{
                "telegram": { "botToken": "123:abc" },
                "relay": { "operatorGroupId": -1001234, "requestTimeoutSecs": 10 },
                "storage": { "dbPath": "/var/lib/relay/relay.sqlite3" },
                "history": { "enabled": false }
            }"#,
        )
        .expect("parse");
        assert_eq!(c.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(c.relay.operator_group_id, Some(-1001234));
        assert_eq!(c.relay.request_timeout_secs, 10);
        assert_eq!(
            c.storage.db_path,
            Some(PathBuf::from("/var/lib/relay/relay.sqlite3"))
        );
        assert!(!c.history.enabled);
    }

    #[test]
    fn resolve_db_path_override() {
        let mut c = Config::default();
        c.storage.db_path = Some(PathBuf::from("/tmp/x.sqlite3"));
        assert_eq!(resolve_db_path(&c), PathBuf::from("/tmp/x.sqlite3"));
    }

    #[test]
    fn request_timeout_has_floor() {
        let mut c = Config::default();
        c.relay.request_timeout_secs = 0;
        assert_eq!(request_timeout(&c), Duration::from_secs(1));
    }
}
